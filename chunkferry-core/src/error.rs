use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::address::RootHash;
use crate::store::TransferState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure kinds surfaced by the chunking and transfer pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O failure ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by storage backend: {0}")]
    Rejected(String),

    #[error("root hash {0} not found")]
    NotFound(RootHash),

    #[error("integrity failure: expected root hash {expected}, bytes address to {actual}")]
    IntegrityFailure { expected: RootHash, actual: RootHash },

    #[error("manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("manifest incomplete: chunk {index} is {state}, not uploaded")]
    IncompleteManifest { index: u32, state: TransferState },

    #[error("chunk {index}: invalid transition {from} -> {to}")]
    InvalidTransition { index: u32, from: TransferState, to: TransferState },

    #[error("reassembled bytes of chunk {index} differ from the source chunk")]
    Mismatch { index: u32 },

    #[error("unsafe output path: {0}")]
    UnsafePath(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io { context: context.into(), source }
    }

    /// Transient failures that a later run over the same manifest may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::BackendUnavailable(_))
    }
}

/// Attach a description to a bare `io::Result`.
pub trait IoResultExt<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::io(f(), e))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Split,
    Upload,
    Download,
    Verify,
    Manifest,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Split => "split",
            Stage::Upload => "upload",
            Stage::Download => "download",
            Stage::Verify => "verify",
            Stage::Manifest => "manifest",
        };
        f.write_str(s)
    }
}

/// An [`Error`] tagged with where in the pipeline it happened.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub chunk: Option<u32>,
    pub root_hash: Option<RootHash>,
    /// Output left behind by an aborted download. Not safe to consume.
    pub partial_output: Option<PathBuf>,
    pub error: Error,
}

impl StageError {
    pub fn new(stage: Stage, error: Error) -> Self {
        Self { stage, chunk: None, root_hash: None, partial_output: None, error }
    }

    pub fn chunk(mut self, index: u32) -> Self {
        self.chunk = Some(index);
        self
    }

    pub fn root(mut self, root_hash: RootHash) -> Self {
        self.root_hash = Some(root_hash);
        self
    }

    pub fn partial(mut self, path: PathBuf) -> Self {
        self.partial_output = Some(path);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed", self.stage)?;
        if let Some(i) = self.chunk {
            write!(f, " at chunk {i}")?;
        }
        if let Some(r) = &self.root_hash {
            write!(f, " (root hash {r})")?;
        }
        write!(f, ": {}", self.error)?;
        if let Some(p) = &self.partial_output {
            write!(f, "; partial output {} is incomplete and must not be used", p.display())?;
        }
        Ok(())
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
