use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub const MIB: u64 = 1 << 20;
pub const DEFAULT_CHUNK_SIZE: usize = 400 * (1 << 20);
pub const DEFAULT_MAX_CHUNKS: u32 = 10;
pub const DEFAULT_REPLICAS: u32 = 1;
pub const DEFAULT_CHUNKS_DIR: &str = "chunks";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Everything a run needs, passed in explicitly. Nothing here is read from the
/// process environment by the library.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    pub input: PathBuf,
    pub chunk_size: usize,
    pub max_chunks: u32,
    /// Copies requested from the storage network; recorded in the manifest.
    pub replicas: u32,
    /// Fixed per-chunk deadline. `None` scales with chunk size.
    pub chunk_timeout: Option<Duration>,
    pub concurrency: usize,
    /// In-run re-attempts of a chunk after a retryable failure.
    pub retries: u32,
    pub chunks_dir: PathBuf,
    pub download_dir: PathBuf,
    /// Defaults to `<chunks_dir>/manifest.json`.
    pub manifest_path: Option<PathBuf>,
    pub progress: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks: DEFAULT_MAX_CHUNKS,
            replicas: DEFAULT_REPLICAS,
            chunk_timeout: None,
            concurrency: 1,
            retries: 0,
            chunks_dir: PathBuf::from(DEFAULT_CHUNKS_DIR),
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            manifest_path: None,
            progress: false,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be > 0".into()));
        }
        if self.max_chunks == 0 {
            return Err(Error::InvalidConfig("max chunk count must be > 0".into()));
        }
        if self.replicas == 0 {
            return Err(Error::InvalidConfig("replica count must be > 0".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be > 0".into()));
        }
        if matches!(self.chunk_timeout, Some(t) if t.is_zero()) {
            return Err(Error::InvalidConfig("chunk timeout must be > 0".into()));
        }
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path.clone().unwrap_or_else(|| self.chunks_dir.join(MANIFEST_FILE))
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            chunk_timeout: self.chunk_timeout,
            concurrency: self.concurrency,
            retries: self.retries,
            progress: self.progress,
        }
    }
}

/// The subset of [`TransferConfig`] the upload and download pipelines use.
#[derive(Clone, Copy, Debug)]
pub struct PipelineOptions {
    pub chunk_timeout: Option<Duration>,
    pub concurrency: usize,
    pub retries: u32,
    pub progress: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        TransferConfig::default().pipeline_options()
    }
}

impl PipelineOptions {
    pub fn timeout_for(&self, size: u64) -> Duration {
        self.chunk_timeout.unwrap_or_else(|| scaled_timeout(size))
    }
}

/// Two minutes plus 1.2s per MiB: a 400 MiB chunk gets ten minutes.
pub fn scaled_timeout(size: u64) -> Duration {
    let per_mib_ms = size.saturating_mul(1_200) / MIB;
    Duration::from_millis(120_000u64.saturating_add(per_mib_ms))
}
