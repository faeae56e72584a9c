use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const REPORT_EVERY: Duration = Duration::from_secs(5);

/// Periodic stderr progress line for long transfers.
#[derive(Clone, Debug)]
pub struct Progress {
    enabled: bool,
    stage: Arc<Mutex<String>>,
    chunks_done: Arc<AtomicUsize>,
    chunks_total: Arc<AtomicUsize>,
    bytes_done: Arc<AtomicU64>,
    bytes_total: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    /// Bumped by every `start`; a reporter exits once it is out of date.
    generation: Arc<AtomicU64>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: Arc::new(Mutex::new(String::new())),
            chunks_done: Arc::new(AtomicUsize::new(0)),
            chunks_total: Arc::new(AtomicUsize::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    /// Reset counters for a new stage.
    pub fn begin(&self, stage: &str, chunks: usize, bytes: u64) {
        *self.stage.lock() = stage.to_string();
        self.chunks_total.store(chunks, Ordering::Relaxed);
        self.chunks_done.store(0, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
    }

    pub fn chunk_done(&self, bytes: u64) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn chunks_done(&self) -> usize {
        self.chunks_done.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        if !self.enabled || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            loop {
                thread::sleep(REPORT_EVERY);
                if !this.is_current(generation) {
                    break;
                }
                eprintln!("[{:>4}s] {}", t0.elapsed().as_secs(), this.line());
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    fn line(&self) -> String {
        let s = self.stage.lock().clone();
        let cd = self.chunks_done.load(Ordering::Relaxed);
        let ct = self.chunks_total.load(Ordering::Relaxed);
        let bd = self.bytes_done.load(Ordering::Relaxed);
        let bt = self.bytes_total.load(Ordering::Relaxed);
        let pct = if bt > 0 { (bd as f64 / bt as f64) * 100.0 } else { 0.0 };
        format!("{} | chunks {}/{} | bytes {}%", s, cd, ct, pct as i32)
    }
}
