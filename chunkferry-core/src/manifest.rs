use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::address::RootHash;
use crate::error::{Error, IoResultExt, Result};
use crate::store::{TransferRecord, TransferState};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SourceInfo {
    pub source_name: String,
    pub source_size: u64,
    pub chunk_size: usize,
    pub replicas: u32,
}

impl SourceInfo {
    pub fn new(source_name: impl Into<String>, source_size: u64, chunk_size: usize, replicas: u32) -> Self {
        Self { source_name: source_name.into(), source_size, chunk_size, replicas }
    }
}

/// Durable record of an upload run; all a later download needs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub created_utc: String,
    #[serde(flatten)]
    pub source: SourceInfo,
    pub records: Vec<TransferRecord>,
}

impl Manifest {
    /// Parse and validate. Relative chunk paths are resolved against `base`.
    pub fn from_json(bytes: &[u8], base: &Path) -> Result<Self> {
        let mut m: Manifest =
            serde_json::from_slice(bytes).map_err(|e| Error::ManifestCorrupt(e.to_string()))?;
        m.validate()?;
        for r in &mut m.records {
            if r.source_path.is_relative() {
                r.source_path = base.join(&r.source_path);
            }
        }
        Ok(m)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("read manifest {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        Self::from_json(&bytes, base)
    }

    /// Atomically replace `path`. Chunk paths are written relative to the
    /// manifest's directory where possible.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;

        let mut out = self.clone();
        let abs_dir = absolute(dir);
        for r in &mut out.records {
            if let Some(rel) = pathdiff::diff_paths(absolute(&r.source_path), &abs_dir) {
                r.source_path = rel;
            }
        }
        let json = serde_json::to_vec_pretty(&out)
            .map_err(|e| Error::ManifestCorrupt(format!("serialize: {e}")))?;

        let tmp = tmp_path(path);
        {
            let mut f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            f.write_all(&json).with_context(|| format!("write {}", tmp.display()))?;
            f.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))
    }

    /// Versions match, indices run 1..=N in order, and every record's root
    /// hash agrees with its state.
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(Error::ManifestCorrupt(format!("unsupported version {}", self.version)));
        }
        if self.source.chunk_size == 0 {
            return Err(Error::ManifestCorrupt("chunk_size is 0".into()));
        }
        let last = self.records.len();
        for (pos, r) in self.records.iter().enumerate() {
            let expected = pos as u32 + 1;
            if r.index != expected {
                return Err(Error::ManifestCorrupt(format!(
                    "index gap: expected chunk {expected}, found {}",
                    r.index
                )));
            }
            if r.size == 0 || r.size > self.source.chunk_size as u64 {
                return Err(Error::ManifestCorrupt(format!("chunk {} has size {}", r.index, r.size)));
            }
            if pos + 1 < last && r.size != self.source.chunk_size as u64 {
                return Err(Error::ManifestCorrupt(format!(
                    "chunk {} is short ({} bytes) but is not the last chunk",
                    r.index, r.size
                )));
            }
            r.check().map_err(Error::ManifestCorrupt)?;
        }
        Ok(())
    }

    /// `(index, root hash)` for every chunk; fails unless all are uploaded.
    pub fn root_hashes(&self) -> Result<Vec<(u32, RootHash)>> {
        self.records
            .iter()
            .map(|r| match (r.state, r.root_hash) {
                (TransferState::Uploaded, Some(h)) => Ok((r.index, h)),
                _ => Err(Error::IncompleteManifest { index: r.index, state: r.state }),
            })
            .collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.records.iter().all(|r| r.state == TransferState::Uploaded)
    }
}

/// Exclusive advisory lock on `<manifest>.lock`, held for the duration of an
/// upload run so two runs never write the same manifest.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
    path: PathBuf,
}

impl ManifestLock {
    pub fn acquire(manifest: &Path) -> Result<Self> {
        let mut name = manifest.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create dir {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        file.try_lock_exclusive()
            .with_context(|| format!("lock {} (another run holds it?)", path.display()))?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn absolute(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(p)).unwrap_or_else(|_| p.to_path_buf())
    }
}
