use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::seq::index::sample;
use tracing::{debug, warn};

use super::{BackendError, Receipt, StorageBackend, Stored};
use crate::address::{self, RootHash};
use crate::error::{Error, IoResultExt, Result};

/// How `put` picks the nodes that receive a replica.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NodeSelection {
    /// The first `replicas` nodes, in order.
    #[default]
    Trusted,
    /// `replicas` distinct nodes chosen at random.
    Random,
}

impl fmt::Display for NodeSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeSelection::Trusted => "trusted",
            NodeSelection::Random => "random",
        })
    }
}

impl FromStr for NodeSelection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trusted" => Ok(NodeSelection::Trusted),
            "random" => Ok(NodeSelection::Random),
            other => Err(format!("unknown node selection {other:?} (expected trusted or random)")),
        }
    }
}

/// A storage network simulated on local disk: `<root>/node-NN/<root hash>`.
#[derive(Debug)]
pub struct DirBackend {
    root: PathBuf,
    nodes: usize,
    replicas: usize,
    selection: NodeSelection,
    seq: AtomicU64,
}

impl DirBackend {
    /// Create (or reuse) `nodes` node directories under `root`.
    pub fn open(root: &Path, nodes: usize, replicas: usize, selection: NodeSelection) -> Result<Self> {
        if nodes == 0 {
            return Err(Error::InvalidConfig("node count must be > 0".into()));
        }
        if replicas == 0 || replicas > nodes {
            return Err(Error::InvalidConfig(format!(
                "replicas must be between 1 and the node count ({nodes}), got {replicas}"
            )));
        }
        for i in 0..nodes {
            let d = node_dir(root, i);
            fs::create_dir_all(&d).with_context(|| format!("create dir {}", d.display()))?;
        }
        Ok(Self { root: root.to_path_buf(), nodes, replicas, selection, seq: AtomicU64::new(0) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, node: usize, root_hash: &RootHash) -> PathBuf {
        node_dir(&self.root, node).join(root_hash.to_hex())
    }

    fn select(&self) -> Vec<usize> {
        match self.selection {
            NodeSelection::Trusted => (0..self.replicas).collect(),
            NodeSelection::Random => {
                let mut picked = sample(&mut rand::thread_rng(), self.nodes, self.replicas).into_vec();
                picked.sort_unstable();
                picked
            }
        }
    }

    /// Node directories present on disk, in name order. A downloader may see
    /// more nodes than this handle was opened with.
    fn known_nodes(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = match fs::read_dir(&self.root) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.is_dir()
                        && p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("node-"))
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        dirs.sort();
        dirs
    }
}

impl StorageBackend for DirBackend {
    fn put(&self, data: &[u8]) -> std::result::Result<Stored, BackendError> {
        if data.is_empty() {
            return Err(BackendError::Rejected("empty blob".into()));
        }
        let root_hash = address::root_hash(data);
        let nodes = self.select();
        for &n in &nodes {
            let path = self.object_path(n, &root_hash);
            if replica_intact(&path, &root_hash) {
                debug!(node = n, root = %root_hash.short(), "replica already present");
                continue;
            }
            write_atomic(&path, data)
                .map_err(|e| BackendError::Unavailable(format!("node-{n:02}: {e}")))?;
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        debug!(root = %root_hash.short(), ?nodes, "stored");
        Ok(Stored { receipt: Receipt::derive(&root_hash, &nodes, seq), root_hash })
    }

    /// First replica whose bytes still address to `root_hash`. When every
    /// copy is damaged, one of them is returned so the caller's integrity
    /// check reports it.
    fn get(&self, root_hash: &RootHash) -> std::result::Result<Vec<u8>, BackendError> {
        let name = root_hash.to_hex();
        let mut last_err = None;
        let mut damaged = None;
        for dir in self.known_nodes() {
            match fs::read(dir.join(&name)) {
                Ok(data) if address::root_hash(&data) == *root_hash => return Ok(data),
                Ok(data) => {
                    warn!(node = %dir.display(), root = %root_hash.short(), "replica damaged; trying next node");
                    damaged.get_or_insert(data);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(node = %dir.display(), error = %e, "replica unreadable");
                    last_err = Some(e);
                }
            }
        }
        if let Some(data) = damaged {
            return Ok(data);
        }
        match last_err {
            Some(e) => Err(BackendError::Unavailable(format!("no readable replica of {root_hash}: {e}"))),
            None => Err(BackendError::NotFound(*root_hash)),
        }
    }

    fn name(&self) -> &str {
        "dir"
    }
}

fn node_dir(root: &Path, i: usize) -> PathBuf {
    root.join(format!("node-{i:02}"))
}

fn replica_intact(path: &Path, root_hash: &RootHash) -> bool {
    fs::read(path).is_ok_and(|existing| address::root_hash(&existing) == *root_hash)
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}
