//! The storage network, seen from the pipeline: put bytes, get bytes back by
//! root hash. Node selection and replication live behind this boundary.

mod dir;
mod memory;

pub use dir::{DirBackend, NodeSelection};
pub use memory::MemoryBackend;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::RootHash;
use crate::error::Error;

/// Backend proof of submission (a transaction id, for a chain-backed
/// network). Kept for audit only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0x`-prefixed digest binding a root hash to where and when it was
    /// stored.
    pub fn derive(root_hash: &RootHash, nodes: &[usize], seq: u64) -> Self {
        let mut h = blake3::Hasher::new();
        h.update(b"chunkferry-receipt");
        h.update(root_hash.as_bytes());
        for n in nodes {
            h.update(&(*n as u64).to_le_bytes());
        }
        h.update(&seq.to_le_bytes());
        Self(format!("0x{}", h.finalize().to_hex()))
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stored {
    pub receipt: Receipt,
    pub root_hash: RootHash,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("{0} not found")]
    NotFound(RootHash),
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(s) => Error::BackendUnavailable(s),
            BackendError::Timeout(d) => Error::Timeout(d),
            BackendError::Rejected(s) => Error::Rejected(s),
            BackendError::NotFound(r) => Error::NotFound(r),
        }
    }
}

pub trait StorageBackend: Send + Sync {
    /// Store `data`, returning a receipt and its root hash.
    fn put(&self, data: &[u8]) -> Result<Stored, BackendError>;

    /// Bytes addressed by `root_hash`.
    fn get(&self, root_hash: &RootHash) -> Result<Vec<u8>, BackendError>;

    /// Short label for logs.
    fn name(&self) -> &str {
        "backend"
    }
}
