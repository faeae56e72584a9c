//! Split, upload, download and verify, driven from one [`TransferConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::address::{self, RootHash};
use crate::backend::StorageBackend;
use crate::chunker::{Chunk, Chunker};
use crate::config::TransferConfig;
use crate::deadline::CancelToken;
use crate::download::{DownloadPipeline, DownloadPlan, DownloadReport, OutputTarget};
use crate::error::{Error, IoResultExt, Result, Stage, StageError};
use crate::manifest::{Manifest, ManifestLock, SourceInfo};
use crate::path_safety::{resolve_output, PathPolicy};
use crate::store::ChunkStore;
use crate::upload::{UploadOutcome, UploadPipeline};
use crate::verify::{verify_reassembly, VerifyReport};

/// File name used when a single object is downloaded without one.
pub const DEFAULT_DOWNLOAD_NAME: &str = "downloaded.dat";

/// Everything a round trip produced, up to the stage that stopped it.
#[derive(Debug, Default)]
pub struct RoundTripReport {
    pub manifest: Option<Manifest>,
    pub reassembled: Option<PathBuf>,
    pub verification: Option<VerifyReport>,
    pub failure: Option<StageError>,
}

impl RoundTripReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.verification.as_ref().is_some_and(VerifyReport::identical)
    }
}

pub struct Orchestrator {
    config: TransferConfig,
    backend: Arc<dyn StorageBackend>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(config: TransferConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, backend, cancel: CancelToken::new() })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn split(&self) -> std::result::Result<Vec<Chunk>, StageError> {
        let c = &self.config;
        Chunker::new(c.chunk_size, c.max_chunks)
            .and_then(|ch| ch.split(&c.input, &c.chunks_dir))
            .map_err(|e| StageError::new(Stage::Split, e))
    }

    /// Chunk files left in `chunks_dir` by an earlier split.
    pub fn discover(&self) -> std::result::Result<Vec<Chunk>, StageError> {
        let c = &self.config;
        Chunker::new(c.chunk_size, c.max_chunks)
            .and_then(|ch| ch.discover(&c.input, &c.chunks_dir))
            .map_err(|e| StageError::new(Stage::Split, e))
    }

    /// Reuse the manifest at the configured path when it describes `chunks`;
    /// otherwise set it aside and start fresh.
    pub fn prepare_store(&self, chunks: &[Chunk]) -> std::result::Result<ChunkStore, StageError> {
        self.prepare(chunks).map_err(|e| StageError::new(Stage::Manifest, e))
    }

    /// Upload every chunk that is not yet uploaded, resuming from the
    /// manifest on disk.
    pub fn upload(&self, chunks: &[Chunk]) -> std::result::Result<UploadOutcome, StageError> {
        let path = self.config.manifest_path();
        let _lock = ManifestLock::acquire(&path).map_err(|e| StageError::new(Stage::Manifest, e))?;
        let store = self.prepare_store(chunks)?;
        Ok(self.upload_pipeline().run(&store))
    }

    /// Reassemble everything a manifest names into `target`, marking each
    /// chunk verified in the manifest.
    pub fn download_manifest(
        &self,
        manifest_path: &Path,
        target: &OutputTarget,
    ) -> std::result::Result<DownloadReport, StageError> {
        let manifest_err = |e: Error| StageError::new(Stage::Manifest, e);
        let _lock = ManifestLock::acquire(manifest_path).map_err(manifest_err)?;
        let store = ChunkStore::open(manifest_path).map_err(manifest_err)?;
        let plan = DownloadPlan::from_manifest(&store.manifest()).map_err(manifest_err)?;
        self.download_pipeline().run(&plan, target, Some(&store))
    }

    /// Fetch one object into the download directory.
    pub fn download_root(
        &self,
        root_hash: RootHash,
        name: Option<&Path>,
    ) -> std::result::Result<DownloadReport, StageError> {
        let name = name.unwrap_or_else(|| Path::new(DEFAULT_DOWNLOAD_NAME));
        let dl_err = |e: Error| StageError::new(Stage::Download, e).root(root_hash);
        fs::create_dir_all(&self.config.download_dir)
            .with_context(|| format!("create dir {}", self.config.download_dir.display()))
            .map_err(dl_err)?;
        let output = resolve_output(&self.config.download_dir, name, PathPolicy::default()).map_err(dl_err)?;
        self.download_pipeline().download_one(root_hash, &output)
    }

    /// Split, upload, download into the download directory, then compare the
    /// result with the chunks byte for byte.
    pub fn run_round_trip(&self) -> RoundTripReport {
        let mut report = RoundTripReport::default();
        if let Err(e) = self.round_trip(&mut report) {
            warn!(error = %e, "round trip failed");
            report.failure = Some(e);
        }
        report
    }

    fn round_trip(&self, report: &mut RoundTripReport) -> std::result::Result<(), StageError> {
        let output = self.reassembly_path().map_err(|e| StageError::new(Stage::Download, e))?;
        let chunks = self.split()?;

        let manifest_path = self.config.manifest_path();
        let _lock = ManifestLock::acquire(&manifest_path).map_err(|e| StageError::new(Stage::Manifest, e))?;
        let store = self.prepare_store(&chunks)?;
        let outcome = self.upload_pipeline().run(&store);
        report.manifest = Some(outcome.manifest);
        if let Some(e) = outcome.first_error {
            return Err(e);
        }

        let plan = DownloadPlan::from_manifest(&store.manifest())
            .map_err(|e| StageError::new(Stage::Manifest, e))?;
        let target = OutputTarget::File(output.clone());
        let downloaded = self.download_pipeline().run(&plan, &target, Some(&store));
        report.manifest = Some(store.manifest());
        downloaded?;
        report.reassembled = Some(output.clone());

        let verification = verify_reassembly(&chunks, &output).map_err(|e| StageError::new(Stage::Verify, e))?;
        let first_mismatch = verification.first_mismatch;
        let identical = verification.identical();
        report.verification = Some(verification);
        if !identical {
            let index = first_mismatch.unwrap_or_else(|| chunks.last().map_or(0, |c| c.index));
            return Err(StageError::new(Stage::Verify, Error::Mismatch { index }).chunk(index));
        }
        info!(output = %output.display(), chunks = chunks.len(), "round trip verified");
        Ok(())
    }

    /// `<download_dir>/<input file name>`, refused if it is the input itself.
    fn reassembly_path(&self) -> Result<PathBuf> {
        let input = &self.config.input;
        let name = input
            .file_name()
            .ok_or_else(|| Error::InvalidConfig(format!("input {} has no file name", input.display())))?;
        let output = self.config.download_dir.join(name);
        if let (Ok(a), Ok(b)) = (fs::canonicalize(input), fs::canonicalize(&output)) {
            if a == b {
                return Err(Error::InvalidConfig(format!(
                    "download directory would overwrite the input {}",
                    input.display()
                )));
            }
        }
        Ok(output)
    }

    fn prepare(&self, chunks: &[Chunk]) -> Result<ChunkStore> {
        let path = self.config.manifest_path();
        if path.exists() {
            let store = ChunkStore::open(&path)?;
            if describes(&store, chunks)? {
                let counts = store.counts();
                info!(
                    manifest = %path.display(),
                    uploaded = counts.uploaded,
                    remaining = chunks.len() - counts.uploaded,
                    "resuming from manifest"
                );
                return Ok(store);
            }
            let mut stale = path.as_os_str().to_owned();
            stale.push(".stale");
            let stale = PathBuf::from(stale);
            warn!(
                manifest = %path.display(),
                moved_to = %stale.display(),
                "manifest describes different chunk contents; starting fresh"
            );
            fs::rename(&path, &stale)
                .with_context(|| format!("rename {} -> {}", path.display(), stale.display()))?;
        }

        let source_name = self
            .config
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let source = SourceInfo::new(
            source_name,
            chunks.iter().map(|c| c.size).sum(),
            self.config.chunk_size,
            self.config.replicas,
        );
        let store = ChunkStore::with_chunks(source, chunks).persist_to(&path);
        store.persist()?;
        Ok(store)
    }

    fn upload_pipeline(&self) -> UploadPipeline {
        UploadPipeline::new(Arc::clone(&self.backend), self.config.pipeline_options())
            .with_cancel(self.cancel.clone())
    }

    fn download_pipeline(&self) -> DownloadPipeline {
        DownloadPipeline::new(Arc::clone(&self.backend), self.config.pipeline_options())
            .with_cancel(self.cancel.clone())
    }
}

/// Same count, every record matches its chunk by index, file name and size,
/// and every recorded root hash is still the address of the chunk's bytes.
fn describes(store: &ChunkStore, chunks: &[Chunk]) -> Result<bool> {
    let records = store.snapshot();
    if records.len() != chunks.len() {
        return Ok(false);
    }
    for (r, c) in records.iter().zip(chunks) {
        if r.index != c.index || r.size != c.size || r.file_name() != c.file_name() {
            return Ok(false);
        }
        if let Some(recorded) = r.root_hash {
            let current = address::root_hash(&c.read()?);
            if current != recorded {
                debug!(index = c.index, %recorded, %current, "chunk content changed since upload");
                return Ok(false);
            }
        }
    }
    Ok(true)
}
