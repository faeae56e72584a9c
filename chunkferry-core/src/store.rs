//! Per-chunk transfer state, shared between pipeline workers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::RootHash;
use crate::backend::Receipt;
use crate::chunker::Chunk;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, SourceInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl TransferState {
    /// `Pending -> Uploading -> {Uploaded | Failed}`, plus `Failed -> Pending`.
    pub fn can_transition_to(self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Pending, Uploading) | (Uploading, Uploaded) | (Uploading, Failed) | (Failed, Pending)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Pending => "pending",
            TransferState::Uploading => "uploading",
            TransferState::Uploaded => "uploaded",
            TransferState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub index: u32,
    pub source_path: PathBuf,
    pub size: u64,
    pub state: TransferState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<RootHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Retrieved and re-addressed successfully by a download run.
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub attempts: u32,
}

impl TransferRecord {
    pub fn pending(chunk: &Chunk) -> Self {
        Self {
            index: chunk.index,
            source_path: chunk.source_path.clone(),
            size: chunk.size,
            state: TransferState::Pending,
            root_hash: None,
            receipt: None,
            error: None,
            verified: false,
            attempts: 0,
        }
    }

    pub fn chunk(&self) -> Chunk {
        Chunk { index: self.index, source_path: self.source_path.clone(), size: self.size }
    }

    pub fn file_name(&self) -> String {
        self.chunk().file_name()
    }

    /// Root hash present iff uploaded; error text present iff failed.
    pub fn check(&self) -> std::result::Result<(), String> {
        let uploaded = self.state == TransferState::Uploaded;
        if uploaded != self.root_hash.is_some() {
            return Err(format!(
                "chunk {} is {} but root hash is {}",
                self.index,
                self.state,
                if self.root_hash.is_some() { "present" } else { "absent" }
            ));
        }
        if self.verified && !uploaded {
            return Err(format!("chunk {} is verified but {}", self.index, self.state));
        }
        if (self.state == TransferState::Failed) != self.error.is_some() {
            return Err(format!("chunk {} error text does not match state {}", self.index, self.state));
        }
        Ok(())
    }
}

/// Counts by state, for summaries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub uploading: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub verified: usize,
}

/// The mutable manifest. Each record sits behind its own lock; the outer
/// lock only guards adding records.
#[derive(Debug)]
pub struct ChunkStore {
    source: SourceInfo,
    created_utc: String,
    records: RwLock<BTreeMap<u32, Arc<Mutex<TransferRecord>>>>,
    persist_to: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl ChunkStore {
    pub fn new(source: SourceInfo) -> Self {
        Self {
            source,
            created_utc: chrono::Utc::now().to_rfc3339(),
            records: RwLock::new(BTreeMap::new()),
            persist_to: None,
            persist_lock: Mutex::new(()),
        }
    }

    pub fn with_chunks(source: SourceInfo, chunks: &[Chunk]) -> Self {
        let store = Self::new(source);
        for c in chunks {
            store.record(c);
        }
        store
    }

    /// Rebuild a store from a loaded manifest. Records caught mid-upload by
    /// a dead process become `Failed` so a resumed run retries them.
    pub fn from_manifest(manifest: Manifest) -> Self {
        let mut map = BTreeMap::new();
        for mut rec in manifest.records {
            if rec.state == TransferState::Uploading {
                warn!(index = rec.index, "chunk was mid-upload when the manifest was written; marking failed");
                rec.state = TransferState::Failed;
                rec.error = Some("interrupted".to_string());
            }
            map.insert(rec.index, Arc::new(Mutex::new(rec)));
        }
        Self {
            source: manifest.source,
            created_utc: manifest.created_utc,
            records: RwLock::new(map),
            persist_to: None,
            persist_lock: Mutex::new(()),
        }
    }

    /// Load `path` and keep it updated on every terminal transition.
    pub fn open(path: &Path) -> Result<Self> {
        let manifest = Manifest::load(path)?;
        Ok(Self::from_manifest(manifest).persist_to(path))
    }

    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_to = Some(path.into());
        self
    }

    pub fn manifest_path(&self) -> Option<&Path> {
        self.persist_to.as_deref()
    }

    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    /// Register `chunk` as Pending. Known indices are left as they are.
    pub fn record(&self, chunk: &Chunk) -> TransferRecord {
        if let Some(existing) = self.records.read().get(&chunk.index) {
            return existing.lock().clone();
        }
        let mut map = self.records.write();
        let slot = map
            .entry(chunk.index)
            .or_insert_with(|| Arc::new(Mutex::new(TransferRecord::pending(chunk))));
        let rec = slot.lock().clone();
        rec
    }

    pub fn get(&self, index: u32) -> Option<TransferRecord> {
        self.slot(index).map(|s| s.lock().clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn mark_uploading(&self, index: u32) -> Result<()> {
        self.transition(index, TransferState::Uploading, |r| {
            r.attempts += 1;
            r.error = None;
        })
    }

    pub fn mark_uploaded(&self, index: u32, root_hash: RootHash, receipt: Receipt) -> Result<()> {
        self.transition(index, TransferState::Uploaded, |r| {
            r.root_hash = Some(root_hash);
            r.receipt = Some(receipt);
        })?;
        self.persist()
    }

    pub fn mark_failed(&self, index: u32, error: &Error) -> Result<()> {
        let text = error.to_string();
        self.transition(index, TransferState::Failed, |r| r.error = Some(text))?;
        self.persist()
    }

    /// The retry edge.
    pub fn mark_pending(&self, index: u32) -> Result<()> {
        self.transition(index, TransferState::Pending, |r| r.error = None)
    }

    pub fn mark_verified(&self, index: u32) -> Result<()> {
        let slot = self.slot(index).ok_or_else(|| unknown(index))?;
        {
            let mut rec = slot.lock();
            if rec.state != TransferState::Uploaded {
                return Err(Error::IncompleteManifest { index, state: rec.state });
            }
            rec.verified = true;
        }
        self.persist()
    }

    /// All records in index order.
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        let slots: Vec<_> = self.records.read().values().cloned().collect();
        slots.iter().map(|s| s.lock().clone()).collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut c = StateCounts::default();
        for r in self.snapshot() {
            match r.state {
                TransferState::Pending => c.pending += 1,
                TransferState::Uploading => c.uploading += 1,
                TransferState::Uploaded => c.uploaded += 1,
                TransferState::Failed => c.failed += 1,
            }
            if r.verified {
                c.verified += 1;
            }
        }
        c
    }

    pub fn manifest(&self) -> Manifest {
        Manifest {
            version: crate::manifest::MANIFEST_VERSION,
            created_utc: self.created_utc.clone(),
            source: self.source.clone(),
            records: self.snapshot(),
        }
    }

    /// Write the manifest if the store is bound to a path.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.persist_to else { return Ok(()) };
        let _guard = self.persist_lock.lock();
        self.manifest().save(path)?;
        debug!(path = %path.display(), "manifest persisted");
        Ok(())
    }

    fn slot(&self, index: u32) -> Option<Arc<Mutex<TransferRecord>>> {
        self.records.read().get(&index).cloned()
    }

    fn transition(
        &self,
        index: u32,
        to: TransferState,
        update: impl FnOnce(&mut TransferRecord),
    ) -> Result<()> {
        let slot = self.slot(index).ok_or_else(|| unknown(index))?;
        let mut rec = slot.lock();
        if !rec.state.can_transition_to(to) {
            return Err(Error::InvalidTransition { index, from: rec.state, to });
        }
        rec.state = to;
        update(&mut rec);
        Ok(())
    }
}

fn unknown(index: u32) -> Error {
    Error::ManifestCorrupt(format!("no record for chunk {index}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::root_hash;

    fn store_with(n: u32) -> ChunkStore {
        let chunks: Vec<Chunk> = (1..=n)
            .map(|i| Chunk { index: i, source_path: format!("c{i}").into(), size: 10 })
            .collect();
        ChunkStore::with_chunks(SourceInfo::new("src.bin", 10 * n as u64, 10, 1), &chunks)
    }

    #[test]
    fn happy_path_transitions() {
        let s = store_with(1);
        let r = root_hash(b"x");
        s.mark_uploading(1).unwrap();
        s.mark_uploaded(1, r, Receipt::new("0xabc")).unwrap();
        let rec = s.get(1).unwrap();
        assert_eq!(rec.state, TransferState::Uploaded);
        assert_eq!(rec.root_hash, Some(r));
        assert_eq!(rec.attempts, 1);
        assert!(rec.check().is_ok());
    }

    #[test]
    fn rejects_skipping_uploading() {
        let s = store_with(1);
        let err = s.mark_uploaded(1, root_hash(b"x"), Receipt::new("r")).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition { index: 1, from: TransferState::Pending, to: TransferState::Uploaded }
        ));
        assert_eq!(s.get(1).unwrap().state, TransferState::Pending);
    }

    #[test]
    fn failed_can_only_go_back_to_pending() {
        let s = store_with(1);
        s.mark_uploading(1).unwrap();
        s.mark_failed(1, &Error::Rejected("nope".into())).unwrap();
        assert!(s.mark_uploading(1).is_err());
        s.mark_pending(1).unwrap();
        s.mark_uploading(1).unwrap();
        assert_eq!(s.get(1).unwrap().attempts, 2);
        assert!(s.get(1).unwrap().error.is_none());
    }

    #[test]
    fn uploaded_is_terminal() {
        let s = store_with(1);
        s.mark_uploading(1).unwrap();
        s.mark_uploaded(1, root_hash(b"x"), Receipt::new("r")).unwrap();
        assert!(s.mark_pending(1).is_err());
        assert!(s.mark_failed(1, &Error::Cancelled).is_err());
    }

    #[test]
    fn verify_requires_uploaded() {
        let s = store_with(2);
        assert!(s.mark_verified(1).is_err());
        s.mark_uploading(2).unwrap();
        s.mark_uploaded(2, root_hash(b"y"), Receipt::new("r")).unwrap();
        s.mark_verified(2).unwrap();
        assert_eq!(s.counts().verified, 1);
    }

    #[test]
    fn record_is_idempotent_and_snapshot_ordered() {
        let s = store_with(3);
        s.mark_uploading(2).unwrap();
        let again = s.record(&Chunk { index: 2, source_path: "c2".into(), size: 10 });
        assert_eq!(again.state, TransferState::Uploading);
        let idx: Vec<u32> = s.snapshot().iter().map(|r| r.index).collect();
        assert_eq!(idx, vec![1, 2, 3]);
    }

    #[test]
    fn interrupted_uploads_reload_as_failed() {
        let s = store_with(2);
        s.mark_uploading(1).unwrap();
        let reloaded = ChunkStore::from_manifest(s.manifest());
        let rec = reloaded.get(1).unwrap();
        assert_eq!(rec.state, TransferState::Failed);
        assert_eq!(rec.error.as_deref(), Some("interrupted"));
        assert_eq!(reloaded.get(2).unwrap().state, TransferState::Pending);
    }
}
