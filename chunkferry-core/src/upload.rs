//! Drives pending chunks through `StorageBackend::put`.
//!
//! Chunks go out in index order, `concurrency` at a time. The first chunk
//! that fails for good stops the run: later windows are never started, so the
//! manifest never ends up with an uploaded chunk past an unexplained hole.

use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::address;
use crate::backend::{StorageBackend, Stored};
use crate::config::PipelineOptions;
use crate::deadline::{call_with_deadline, CancelToken};
use crate::error::{Error, Result, Stage, StageError};
use crate::manifest::Manifest;
use crate::progress::Progress;
use crate::store::{ChunkStore, TransferRecord, TransferState};

#[derive(Debug)]
pub struct UploadOutcome {
    pub manifest: Manifest,
    pub uploaded: usize,
    /// Records already uploaded by an earlier run.
    pub skipped: usize,
    pub first_error: Option<StageError>,
}

impl UploadOutcome {
    pub fn is_complete(&self) -> bool {
        self.first_error.is_none() && self.manifest.is_complete()
    }

    pub fn into_result(self) -> std::result::Result<Manifest, StageError> {
        match self.first_error {
            Some(e) => Err(e),
            None => Ok(self.manifest),
        }
    }
}

pub struct UploadPipeline {
    backend: Arc<dyn StorageBackend>,
    opts: PipelineOptions,
    cancel: CancelToken,
    progress: Progress,
}

impl UploadPipeline {
    pub fn new(backend: Arc<dyn StorageBackend>, opts: PipelineOptions) -> Self {
        Self { backend, opts, cancel: CancelToken::new(), progress: Progress::new(opts.progress) }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upload every record of `store` that is not yet `Uploaded`.
    pub fn run(&self, store: &ChunkStore) -> UploadOutcome {
        let todo: Vec<TransferRecord> = store
            .snapshot()
            .into_iter()
            .filter(|r| r.state != TransferState::Uploaded)
            .collect();
        let skipped = store.len() - todo.len();
        let mut uploaded = 0usize;
        let mut first_error = None;

        if todo.is_empty() {
            info!(skipped, "nothing to upload; all chunks already uploaded");
        } else {
            info!(
                chunks = todo.len(),
                skipped,
                concurrency = self.opts.concurrency,
                backend = self.backend.name(),
                "starting upload"
            );
            match worker_pool(self.opts.concurrency) {
                Ok(pool) => {
                    self.progress.begin("Uploading", todo.len(), todo.iter().map(|r| r.size).sum());
                    self.progress.start();
                    for window in todo.chunks(self.opts.concurrency.max(1)) {
                        if let Err(e) = self.cancel.check() {
                            first_error = Some(StageError::new(Stage::Upload, e).chunk(window[0].index));
                            break;
                        }
                        let results: Vec<std::result::Result<(), StageError>> = pool.install(|| {
                            window.par_iter().map(|rec| self.upload_chunk(store, rec)).collect()
                        });
                        for r in results {
                            match r {
                                Ok(()) => uploaded += 1,
                                Err(e) => {
                                    if first_error.is_none() {
                                        first_error = Some(e);
                                    }
                                }
                            }
                        }
                        if first_error.is_some() {
                            break;
                        }
                    }
                    self.progress.stop();
                }
                Err(e) => first_error = Some(StageError::new(Stage::Upload, e)),
            }
        }

        if let Some(e) = &first_error {
            warn!(error = %e, uploaded, "upload stopped");
        }
        UploadOutcome { manifest: store.manifest(), uploaded, skipped, first_error }
    }

    fn upload_chunk(&self, store: &ChunkStore, rec: &TransferRecord) -> std::result::Result<(), StageError> {
        let index = rec.index;
        let fail = |e: Error| StageError::new(Stage::Upload, e).chunk(index);
        if rec.state == TransferState::Failed {
            store.mark_pending(index).map_err(fail)?;
        }
        let timeout = self.opts.timeout_for(rec.size);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            store.mark_uploading(index).map_err(fail)?;
            match self.put_once(rec, timeout) {
                Ok(Stored { receipt, root_hash }) => {
                    info!(index, root = %root_hash, receipt = %receipt, "uploaded chunk");
                    store
                        .mark_uploaded(index, root_hash, receipt)
                        .map_err(|e| fail(e).root(root_hash))?;
                    self.progress.chunk_done(rec.size);
                    return Ok(());
                }
                Err(e) => {
                    if let Err(pe) = store.mark_failed(index, &e) {
                        warn!(index, error = %pe, "could not record chunk failure");
                    }
                    if e.is_retryable() && attempt <= self.opts.retries && !self.cancel.is_cancelled() {
                        warn!(index, attempt, error = %e, "retrying chunk");
                        store.mark_pending(index).map_err(fail)?;
                        continue;
                    }
                    return Err(fail(e));
                }
            }
        }
    }

    fn put_once(&self, rec: &TransferRecord, timeout: Duration) -> Result<Stored> {
        let data = rec.chunk().read()?;
        let expected = address::root_hash(&data);
        let backend = Arc::clone(&self.backend);
        let stored =
            call_with_deadline(timeout, &self.cancel, move || backend.put(&data).map_err(Error::from))?;
        if stored.root_hash != expected {
            return Err(Error::IntegrityFailure { expected, actual: stored.root_hash });
        }
        Ok(stored)
    }
}

pub(crate) fn worker_pool(threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("chunkferry-worker-{i}"))
        .build()
        .map_err(|e| Error::InvalidConfig(format!("worker pool: {e}")))
}
