use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{BackendError, Receipt, StorageBackend, Stored};
use crate::address::{self, RootHash};

/// In-process object map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<RootHash, Arc<[u8]>>>,
    seq: AtomicU64,
    puts: AtomicUsize,
    gets: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls received, successful or not.
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, root_hash: &RootHash) -> bool {
        self.objects.read().contains_key(root_hash)
    }

    /// Store `data` under `root_hash` without checking that it addresses
    /// there. Simulates backend-side corruption.
    pub fn insert_unchecked(&self, root_hash: RootHash, data: &[u8]) {
        self.objects.write().insert(root_hash, Arc::from(data));
    }

    pub fn remove(&self, root_hash: &RootHash) -> bool {
        self.objects.write().remove(root_hash).is_some()
    }
}

impl StorageBackend for MemoryBackend {
    fn put(&self, data: &[u8]) -> Result<Stored, BackendError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if data.is_empty() {
            return Err(BackendError::Rejected("empty blob".into()));
        }
        let root_hash = address::root_hash(data);
        self.objects.write().entry(root_hash).or_insert_with(|| Arc::from(data));
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        Ok(Stored { receipt: Receipt::derive(&root_hash, &[0], seq), root_hash })
    }

    fn get(&self, root_hash: &RootHash) -> Result<Vec<u8>, BackendError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.objects
            .read()
            .get(root_hash)
            .map(|b| b.to_vec())
            .ok_or(BackendError::NotFound(*root_hash))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
