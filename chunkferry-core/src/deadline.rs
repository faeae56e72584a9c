//! Deadlines and cancellation for blocking backend calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const POLL: Duration = Duration::from_millis(25);

/// Shared abort flag. Cloning shares the flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Run `op` on a helper thread and wait at most `timeout` for its result.
///
/// On expiry or cancellation the helper is detached; whatever it eventually
/// returns is dropped.
pub fn call_with_deadline<T, F>(timeout: Duration, cancel: &CancelToken, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    cancel.check()?;
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("chunkferry-call".into())
        .spawn(move || {
            let _ = tx.send(op());
        })
        .map_err(|e| Error::io("spawn backend call", e))?;

    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(timeout));
        }
        match rx.recv_timeout((deadline - now).min(POLL)) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => cancel.check()?,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::BackendUnavailable("backend call panicked".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_result_within_deadline() {
        let got = call_with_deadline(Duration::from_secs(5), &CancelToken::new(), || Ok(7)).unwrap();
        assert_eq!(got, 7);
    }

    #[test]
    fn times_out_on_hung_call() {
        let t0 = Instant::now();
        let err = call_with_deadline(Duration::from_millis(50), &CancelToken::new(), || {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(t0.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn cancellation_interrupts_wait() {
        let cancel = CancelToken::new();
        let c2 = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            c2.cancel();
        });
        let err = call_with_deadline(Duration::from_secs(10), &cancel, || {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn already_cancelled_never_starts() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let r2 = ran.clone();
        let err = call_with_deadline(Duration::from_secs(1), &cancel, move || {
            r2.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        thread::sleep(Duration::from_millis(20));
        assert!(!ran.load(Ordering::SeqCst));
    }
}
