//! Content addressing: the function that turns a blob into its root hash.
//!
//! A blob is cut into [`SEGMENT_SIZE`] segments, each segment becomes a Merkle
//! leaf, and the tree root is bound to the blob length so that blobs differing
//! only in trailing bytes never share an address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merkle;

pub const SEGMENT_SIZE: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RootHash([u8; 32]);

impl RootHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// `0x`-prefixed lowercase hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", blake3::Hash::from(self.0).to_hex())
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        let hex = blake3::Hash::from(self.0).to_hex();
        format!("0x{}", &hex[..8])
    }
}

impl fmt::Display for RootHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RootHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootHash({})", self.to_hex())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid root hash {0:?}: expected 64 hex digits with optional 0x prefix")]
pub struct ParseRootHashError(String);

impl FromStr for RootHash {
    type Err = ParseRootHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        blake3::Hash::from_hex(digits)
            .map(|h| Self(*h.as_bytes()))
            .map_err(|_| ParseRootHashError(s.to_string()))
    }
}

impl TryFrom<String> for RootHash {
    type Error = ParseRootHashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RootHash> for String {
    fn from(r: RootHash) -> Self {
        r.to_hex()
    }
}

/// Compute the content address of `data`.
pub fn root_hash(data: &[u8]) -> RootHash {
    let leaves: Vec<blake3::Hash> = data.chunks(SEGMENT_SIZE).map(merkle::leaf).collect();
    let tree = merkle::root(&leaves);
    let mut h = blake3::Hasher::new();
    h.update(tree.as_bytes());
    h.update(&(data.len() as u64).to_le_bytes());
    RootHash(*h.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_with_and_without_prefix() {
        let r = root_hash(b"hello world");
        let hex = r.to_hex();
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 66);
        assert_eq!(hex.parse::<RootHash>().unwrap(), r);
        assert_eq!(hex[2..].parse::<RootHash>().unwrap(), r);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!("0x1234".parse::<RootHash>().is_err());
        assert!("zz".repeat(32).parse::<RootHash>().is_err());
    }

    #[test]
    fn trailing_zeros_change_the_address() {
        let a = vec![7u8; 300];
        let mut b = a.clone();
        b.push(0);
        assert_ne!(root_hash(&a), root_hash(&b));
    }

    #[test]
    fn serializes_as_hex_string() {
        let r = root_hash(b"x");
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, format!("\"{}\"", r.to_hex()));
        let back: RootHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
