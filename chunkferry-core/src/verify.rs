use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::{info, warn};

use crate::chunker::Chunk;
use crate::error::{IoResultExt, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub chunks_ok: u64,
    pub chunks_bad: u64,
    pub bytes_compared: u64,
    pub expected_bytes: u64,
    pub actual_bytes: u64,
    /// Lowest chunk index whose bytes differ or are missing.
    pub first_mismatch: Option<u32>,
}

impl VerifyReport {
    pub fn identical(&self) -> bool {
        self.chunks_bad == 0 && self.expected_bytes == self.actual_bytes
    }
}

/// Compare `reassembled` against the chunk files it was built from, range by
/// range.
pub fn verify_reassembly(chunks: &[Chunk], reassembled: &Path) -> Result<VerifyReport> {
    let f = File::open(reassembled).with_context(|| format!("open {}", reassembled.display()))?;
    let actual_bytes = f.metadata().with_context(|| format!("stat {}", reassembled.display()))?.len();
    // Mapping a zero-length file fails on some platforms.
    let map = if actual_bytes > 0 {
        Some(unsafe { Mmap::map(&f) }.with_context(|| format!("mmap {}", reassembled.display()))?)
    } else {
        None
    };
    let out: &[u8] = map.as_deref().unwrap_or_default();

    let mut report = VerifyReport {
        chunks_ok: 0,
        chunks_bad: 0,
        bytes_compared: 0,
        expected_bytes: chunks.iter().map(|c| c.size).sum(),
        actual_bytes,
        first_mismatch: None,
    };
    let mut offset = 0usize;
    for chunk in chunks {
        let original = chunk.read()?;
        let end = offset + original.len();
        let same = out.get(offset..end).is_some_and(|got| got == original.as_slice());
        report.bytes_compared += out.len().min(end).saturating_sub(offset) as u64;
        if same {
            report.chunks_ok += 1;
        } else {
            report.chunks_bad += 1;
            report.first_mismatch.get_or_insert(chunk.index);
            warn!(index = chunk.index, "reassembled bytes differ from chunk");
        }
        offset = end;
    }
    info!(
        ok = report.chunks_ok,
        bad = report.chunks_bad,
        expected = report.expected_bytes,
        actual = report.actual_bytes,
        "verification finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn chunk(dir: &Path, index: u32, data: &[u8]) -> Chunk {
        let p = dir.join(format!("c{index}"));
        fs::write(&p, data).unwrap();
        Chunk { index, source_path: p, size: data.len() as u64 }
    }

    #[test]
    fn identical_reassembly() {
        let td = tempfile::tempdir().unwrap();
        let chunks = vec![chunk(td.path(), 1, b"abcd"), chunk(td.path(), 2, b"ef")];
        let out = td.path().join("out");
        fs::write(&out, b"abcdef").unwrap();
        let rep = verify_reassembly(&chunks, &out).unwrap();
        assert!(rep.identical());
        assert_eq!(rep.bytes_compared, 6);
    }

    #[test]
    fn truncated_and_altered_output() {
        let td = tempfile::tempdir().unwrap();
        let chunks = vec![
            chunk(td.path(), 1, b"abcd"),
            chunk(td.path(), 2, b"efgh"),
            chunk(td.path(), 3, b"ij"),
        ];
        let out = td.path().join("out");
        fs::write(&out, b"abcdeXgh").unwrap();
        let rep = verify_reassembly(&chunks, &out).unwrap();
        assert!(!rep.identical());
        assert_eq!((rep.chunks_ok, rep.chunks_bad), (1, 2));
        assert_eq!(rep.first_mismatch, Some(2));
        assert_eq!(rep.actual_bytes, 8);
        assert_eq!(rep.bytes_compared, 8);
    }

    #[test]
    fn empty_output_file() {
        let td = tempfile::tempdir().unwrap();
        let chunks = vec![chunk(td.path(), 1, b"abcd")];
        let out = td.path().join("out");
        fs::write(&out, b"").unwrap();
        let rep = verify_reassembly(&chunks, &out).unwrap();
        assert_eq!(rep.first_mismatch, Some(1));
        assert_eq!(rep.bytes_compared, 0);
    }
}
