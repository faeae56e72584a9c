#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chunkferry_core::{BackendError, MemoryBackend, RootHash, StorageBackend, Stored, TransferConfig};

/// Deterministic pseudo-random bytes.
pub fn bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) ^ (i >> 8) as u8).collect()
}

pub fn config(dir: &Path, input: &[u8], chunk_size: usize) -> TransferConfig {
    let src = dir.join("input.bin");
    fs::write(&src, input).unwrap();
    TransferConfig {
        input: src,
        chunk_size,
        chunks_dir: dir.join("chunks"),
        download_dir: dir.join("downloads"),
        ..TransferConfig::default()
    }
}

type PutHook = Box<dyn Fn(usize, &[u8]) -> Option<BackendError> + Send + Sync>;

/// Memory backend whose `put` consults a hook first. The hook sees the
/// 1-based call number and the payload.
pub struct ScriptedBackend {
    pub inner: MemoryBackend,
    calls: AtomicUsize,
    hook: PutHook,
}

impl ScriptedBackend {
    pub fn new(hook: impl Fn(usize, &[u8]) -> Option<BackendError> + Send + Sync + 'static) -> Self {
        Self { inner: MemoryBackend::new(), calls: AtomicUsize::new(0), hook: Box::new(hook) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StorageBackend for ScriptedBackend {
    fn put(&self, data: &[u8]) -> Result<Stored, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(e) = (self.hook)(n, data) {
            return Err(e);
        }
        self.inner.put(data)
    }

    fn get(&self, root_hash: &RootHash) -> Result<Vec<u8>, BackendError> {
        self.inner.get(root_hash)
    }
}

/// Delays each call by `step * (max_first_byte - first_byte)`, so chunks
/// whose payload starts with a smaller byte finish last.
pub struct SlowBackend {
    pub inner: MemoryBackend,
    pub step: Duration,
}

impl SlowBackend {
    fn pause(&self, data: &[u8]) {
        let first = data.first().copied().unwrap_or(0);
        thread::sleep(self.step * u32::from(16u8.saturating_sub(first)));
    }
}

impl StorageBackend for SlowBackend {
    fn put(&self, data: &[u8]) -> Result<Stored, BackendError> {
        self.pause(data);
        self.inner.put(data)
    }

    fn get(&self, root_hash: &RootHash) -> Result<Vec<u8>, BackendError> {
        let data = self.inner.get(root_hash)?;
        self.pause(&data);
        Ok(data)
    }
}

/// Never answers within any reasonable deadline.
pub struct HangingBackend;

impl StorageBackend for HangingBackend {
    fn put(&self, _data: &[u8]) -> Result<Stored, BackendError> {
        thread::sleep(Duration::from_secs(30));
        Err(BackendError::Unavailable("woke up".into()))
    }

    fn get(&self, _root_hash: &RootHash) -> Result<Vec<u8>, BackendError> {
        thread::sleep(Duration::from_secs(30));
        Err(BackendError::Unavailable("woke up".into()))
    }
}

/// Reports a root hash for uploads that does not match the payload.
pub struct LyingBackend;

impl StorageBackend for LyingBackend {
    fn put(&self, data: &[u8]) -> Result<Stored, BackendError> {
        let mut other = data.to_vec();
        other.push(0);
        MemoryBackend::new().put(&other)
    }

    fn get(&self, root_hash: &RootHash) -> Result<Vec<u8>, BackendError> {
        Err(BackendError::NotFound(*root_hash))
    }
}
