//! Fetches chunks back by root hash and reassembles them.
//!
//! Every retrieved object is re-addressed before a byte of it is written;
//! a mismatch aborts the run. Chunks are fetched `concurrency` at a time but
//! always written in ascending index order.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::address::{self, RootHash};
use crate::backend::StorageBackend;
use crate::chunker::ChunkNaming;
use crate::config::{PipelineOptions, DEFAULT_CHUNK_SIZE};
use crate::deadline::{call_with_deadline, CancelToken};
use crate::error::{Error, IoResultExt, Result, Stage, StageError};
use crate::manifest::Manifest;
use crate::path_safety::{resolve_output, PathPolicy};
use crate::progress::Progress;
use crate::store::ChunkStore;
use crate::upload::worker_pool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadEntry {
    pub index: u32,
    pub root_hash: RootHash,
    /// Used when writing into a directory target.
    pub file_name: String,
    /// Known for manifest-driven plans; sizes the fetch deadline.
    pub size: Option<u64>,
}

/// Ordered list of objects to fetch.
#[derive(Clone, Debug, Default)]
pub struct DownloadPlan {
    entries: Vec<DownloadEntry>,
}

impl DownloadPlan {
    /// Every record of `manifest`; all must be uploaded.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let hashes = manifest.root_hashes()?;
        let entries = manifest
            .records
            .iter()
            .zip(hashes)
            .map(|(r, (index, root_hash))| DownloadEntry {
                index,
                root_hash,
                file_name: r.file_name(),
                size: Some(r.size),
            })
            .collect();
        Ok(Self { entries })
    }

    /// Root hashes in reassembly order, numbered from 1.
    pub fn from_root_hashes(hashes: &[RootHash], name: &Path) -> Self {
        let naming = ChunkNaming::for_source(name);
        let entries = hashes
            .iter()
            .zip(1u32..)
            .map(|(h, index)| DownloadEntry {
                index,
                root_hash: *h,
                file_name: naming.file_name(index),
                size: None,
            })
            .collect();
        Self { entries }
    }

    pub fn single(root_hash: RootHash, file_name: impl Into<String>) -> Self {
        Self {
            entries: vec![DownloadEntry { index: 1, root_hash, file_name: file_name.into(), size: None }],
        }
    }

    pub fn entries(&self) -> &[DownloadEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputTarget {
    /// All chunks concatenated into one file.
    File(PathBuf),
    /// One file per chunk, named after its entry.
    Directory(PathBuf),
}

impl OutputTarget {
    pub fn path(&self) -> &Path {
        match self {
            OutputTarget::File(p) | OutputTarget::Directory(p) => p,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadReport {
    pub chunks: usize,
    pub bytes: u64,
    pub output: PathBuf,
}

pub struct DownloadPipeline {
    backend: Arc<dyn StorageBackend>,
    opts: PipelineOptions,
    cancel: CancelToken,
    progress: Progress,
    policy: PathPolicy,
}

impl DownloadPipeline {
    pub fn new(backend: Arc<dyn StorageBackend>, opts: PipelineOptions) -> Self {
        Self {
            backend,
            opts,
            cancel: CancelToken::new(),
            progress: Progress::new(opts.progress),
            policy: PathPolicy::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_path_policy(mut self, policy: PathPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetch, verify and write every entry of `plan`. With a `store`, each
    /// written chunk is marked verified there.
    pub fn run(
        &self,
        plan: &DownloadPlan,
        target: &OutputTarget,
        store: Option<&ChunkStore>,
    ) -> std::result::Result<DownloadReport, StageError> {
        let stage_err = |e: Error| StageError::new(Stage::Download, e);
        let mut sink = Sink::open(target, self.policy).map_err(stage_err)?;
        let pool = worker_pool(self.opts.concurrency).map_err(stage_err)?;
        info!(
            chunks = plan.len(),
            output = %target.path().display(),
            backend = self.backend.name(),
            "starting download"
        );
        self.progress.begin(
            "Downloading",
            plan.len(),
            plan.entries.iter().filter_map(|e| e.size).sum(),
        );
        self.progress.start();
        let result = self.fetch_all(plan, &pool, &mut sink, store);
        self.progress.stop();

        let flushed = sink.finish();
        match result {
            Ok(bytes) => {
                flushed.map_err(stage_err)?;
                info!(chunks = plan.len(), bytes, output = %target.path().display(), "download complete");
                Ok(DownloadReport { chunks: plan.len(), bytes, output: target.path().to_path_buf() })
            }
            Err(e) => {
                if let Err(fe) = flushed {
                    warn!(error = %fe, "could not flush partial output");
                }
                Err(e.partial(target.path().to_path_buf()))
            }
        }
    }

    /// Fetch one object into `output`.
    pub fn download_one(
        &self,
        root_hash: RootHash,
        output: &Path,
    ) -> std::result::Result<DownloadReport, StageError> {
        let name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root_hash.to_hex());
        let plan = DownloadPlan::single(root_hash, name);
        self.run(&plan, &OutputTarget::File(output.to_path_buf()), None)
    }

    fn fetch_all(
        &self,
        plan: &DownloadPlan,
        pool: &rayon::ThreadPool,
        sink: &mut Sink,
        store: Option<&ChunkStore>,
    ) -> std::result::Result<u64, StageError> {
        let mut bytes = 0u64;
        for window in plan.entries.chunks(self.opts.concurrency.max(1)) {
            if let Err(e) = self.cancel.check() {
                return Err(StageError::new(Stage::Download, e).chunk(window[0].index));
            }
            let fetched: Vec<Result<Vec<u8>>> =
                pool.install(|| window.par_iter().map(|e| self.fetch_verified(e)).collect());
            for (entry, res) in window.iter().zip(fetched) {
                let fail = |e: Error| {
                    StageError::new(Stage::Download, e).chunk(entry.index).root(entry.root_hash)
                };
                let data = res.map_err(fail)?;
                sink.write(entry, &data).map_err(fail)?;
                if let Some(store) = store {
                    store.mark_verified(entry.index).map_err(fail)?;
                }
                bytes += data.len() as u64;
                self.progress.chunk_done(data.len() as u64);
                debug!(index = entry.index, root = %entry.root_hash, bytes = data.len(), "chunk written");
            }
        }
        Ok(bytes)
    }

    fn fetch_verified(&self, entry: &DownloadEntry) -> Result<Vec<u8>> {
        let timeout = self.opts.timeout_for(entry.size.unwrap_or(DEFAULT_CHUNK_SIZE as u64));
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let backend = Arc::clone(&self.backend);
            let root = entry.root_hash;
            let got = call_with_deadline(timeout, &self.cancel, move || {
                backend.get(&root).map_err(Error::from)
            });
            match got {
                Ok(data) => {
                    let actual = address::root_hash(&data);
                    if actual != entry.root_hash {
                        return Err(Error::IntegrityFailure { expected: entry.root_hash, actual });
                    }
                    return Ok(data);
                }
                Err(e) if e.is_retryable() && attempt <= self.opts.retries && !self.cancel.is_cancelled() => {
                    warn!(index = entry.index, attempt, error = %e, "retrying fetch");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

enum Sink {
    File { out: BufWriter<File>, path: PathBuf },
    Directory { dir: PathBuf, policy: PathPolicy },
}

impl Sink {
    fn open(target: &OutputTarget, policy: PathPolicy) -> Result<Self> {
        match target {
            OutputTarget::File(path) => {
                if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
                }
                let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
                Ok(Sink::File { out: BufWriter::new(f), path: path.clone() })
            }
            OutputTarget::Directory(dir) => {
                fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
                Ok(Sink::Directory { dir: dir.clone(), policy })
            }
        }
    }

    fn write(&mut self, entry: &DownloadEntry, data: &[u8]) -> Result<()> {
        match self {
            Sink::File { out, path } => {
                out.write_all(data).with_context(|| format!("write {}", path.display()))
            }
            Sink::Directory { dir, policy } => {
                let dest = resolve_output(dir, Path::new(&entry.file_name), *policy)?;
                fs::write(&dest, data).with_context(|| format!("write {}", dest.display()))
            }
        }
    }

    fn finish(self) -> Result<()> {
        match self {
            Sink::File { out, path } => {
                let f = out
                    .into_inner()
                    .map_err(|e| Error::io(format!("flush {}", path.display()), e.into_error()))?;
                f.sync_all().with_context(|| format!("sync {}", path.display()))
            }
            Sink::Directory { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn pipeline(backend: Arc<MemoryBackend>) -> DownloadPipeline {
        DownloadPipeline::new(backend, PipelineOptions::default())
    }

    #[test]
    fn reassembles_in_plan_order() {
        let mem = Arc::new(MemoryBackend::new());
        let a = mem.put(b"first ").unwrap().root_hash;
        let b = mem.put(b"second").unwrap().root_hash;
        let td = tempfile::tempdir().unwrap();
        let out = td.path().join("nested/out.txt");
        let plan = DownloadPlan::from_root_hashes(&[a, b], Path::new("out.txt"));
        let rep = pipeline(mem).run(&plan, &OutputTarget::File(out.clone()), None).unwrap();
        assert_eq!(rep.chunks, 2);
        assert_eq!(rep.bytes, 12);
        assert_eq!(fs::read(out).unwrap(), b"first second");
    }

    #[test]
    fn corrupted_object_is_never_written() {
        let mem = Arc::new(MemoryBackend::new());
        let good = mem.put(b"good bytes").unwrap().root_hash;
        let claimed = address::root_hash(b"what was uploaded");
        mem.insert_unchecked(claimed, b"something else");
        let td = tempfile::tempdir().unwrap();
        let dir = td.path().join("parts");
        let plan = DownloadPlan::from_root_hashes(&[good, claimed], Path::new("f.bin"));
        let err = pipeline(mem).run(&plan, &OutputTarget::Directory(dir.clone()), None).unwrap_err();
        assert!(matches!(err.error, Error::IntegrityFailure { .. }));
        assert_eq!(err.chunk, Some(2));
        assert_eq!(err.partial_output.as_deref(), Some(dir.as_path()));
        assert!(dir.join("f-part-01.bin").exists());
        assert!(!dir.join("f-part-02.bin").exists());
    }

    #[test]
    fn download_one_reports_missing_object() {
        let mem = Arc::new(MemoryBackend::new());
        let td = tempfile::tempdir().unwrap();
        let missing = address::root_hash(b"never stored");
        let err = pipeline(mem).download_one(missing, &td.path().join("x.dat")).unwrap_err();
        assert!(matches!(err.error, Error::NotFound(r) if r == missing));
        assert_eq!(err.root_hash, Some(missing));
        assert!(err.to_string().contains("must not be used"));
    }
}
