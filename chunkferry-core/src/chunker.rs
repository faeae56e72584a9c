//! Splits a source file into fixed-size chunk files.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, IoResultExt, Result};

/// One contiguous byte range of the source, materialized as its own file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// 1-based position in the source.
    pub index: u32,
    pub source_path: PathBuf,
    pub size: u64,
}

impl Chunk {
    /// Read the chunk file, checking it still has the recorded length.
    pub fn read(&self) -> Result<Vec<u8>> {
        let data = fs::read(&self.source_path)
            .with_context(|| format!("read chunk {} from {}", self.index, self.source_path.display()))?;
        if data.len() as u64 != self.size {
            return Err(Error::io(
                format!("chunk {} at {}", self.index, self.source_path.display()),
                std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("expected {} bytes, found {}", self.size, data.len()),
                ),
            ));
        }
        Ok(data)
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("chunk-{:02}", self.index))
    }
}

/// `<stem>-part-<NN>.<ext>` names derived from the source file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkNaming {
    stem: String,
    ext: Option<String>,
}

impl ChunkNaming {
    pub fn new(stem: impl Into<String>, ext: Option<String>) -> Self {
        Self { stem: stem.into(), ext }
    }

    pub fn for_source(source: &Path) -> Self {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "input".to_string());
        let ext = source.extension().map(|e| e.to_string_lossy().into_owned());
        Self { stem, ext }
    }

    pub fn file_name(&self, index: u32) -> String {
        match &self.ext {
            Some(ext) => format!("{}-part-{:02}.{}", self.stem, index, ext),
            None => format!("{}-part-{:02}", self.stem, index),
        }
    }

    /// Inverse of [`ChunkNaming::file_name`].
    pub fn parse_index(&self, name: &str) -> Option<u32> {
        let rest = name.strip_prefix(&self.stem)?.strip_prefix("-part-")?;
        let digits = match &self.ext {
            Some(ext) => rest.strip_suffix(ext.as_str())?.strip_suffix('.')?,
            None => rest,
        };
        if digits.len() < 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Chunker {
    chunk_size: usize,
    max_chunks: u32,
}

impl Chunker {
    pub fn new(chunk_size: usize, max_chunks: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be > 0".into()));
        }
        if max_chunks == 0 {
            return Err(Error::InvalidConfig("max chunk count must be > 0".into()));
        }
        Ok(Self { chunk_size, max_chunks })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_chunks(&self) -> u32 {
        self.max_chunks
    }

    /// Split `source` into chunk files under `chunks_dir`.
    pub fn split(&self, source: &Path, chunks_dir: &Path) -> Result<Vec<Chunk>> {
        let f = File::open(source).with_context(|| format!("open {}", source.display()))?;
        let size = f.metadata().with_context(|| format!("stat {}", source.display()))?.len();
        info!(
            input = %source.display(),
            bytes = size,
            chunk_size = self.chunk_size,
            max_chunks = self.max_chunks,
            "splitting"
        );
        self.split_reader(f, &ChunkNaming::for_source(source), chunks_dir)
    }

    /// Split an arbitrary reader. Chunks written before an I/O failure stay
    /// on disk.
    pub fn split_reader<R: Read>(
        &self,
        mut reader: R,
        naming: &ChunkNaming,
        chunks_dir: &Path,
    ) -> Result<Vec<Chunk>> {
        fs::create_dir_all(chunks_dir)
            .with_context(|| format!("create dir {}", chunks_dir.display()))?;

        let mut buf = vec![0u8; self.chunk_size];
        let mut chunks = Vec::new();
        for index in 1..=self.max_chunks {
            let n = read_full(&mut reader, &mut buf)
                .with_context(|| format!("read chunk {index}"))?;
            if n == 0 {
                debug!(index, "end of input");
                break;
            }
            let path = chunks_dir.join(naming.file_name(index));
            fs::write(&path, &buf[..n])
                .with_context(|| format!("write chunk {index} to {}", path.display()))?;
            info!(index, path = %path.display(), bytes = n, "created chunk");
            chunks.push(Chunk { index, source_path: path, size: n as u64 });
            if n < self.chunk_size {
                break;
            }
        }

        if chunks.len() as u32 == self.max_chunks
            && chunks.last().is_some_and(|c| c.size == self.chunk_size as u64)
        {
            let mut extra = [0u8; 1];
            match read_full(&mut reader, &mut extra) {
                Ok(0) => {}
                Ok(_) => warn!(
                    max_chunks = self.max_chunks,
                    "input is larger than max_chunks * chunk_size; the tail was not chunked"
                ),
                Err(e) => warn!(error = %e, "could not check for input past max_chunks"),
            }
        }

        // Leftovers from an earlier, longer split would confuse `discover`.
        for index in chunks.len() as u32 + 1..=self.max_chunks {
            let stale = chunks_dir.join(naming.file_name(index));
            match fs::remove_file(&stale) {
                Ok(()) => debug!(path = %stale.display(), "removed stale chunk"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(format!("remove {}", stale.display()), e)),
            }
        }
        Ok(chunks)
    }

    /// Find chunk files left by an earlier `split` of `source`.
    ///
    /// Indices must run 1..=N without gaps.
    pub fn discover(&self, source: &Path, chunks_dir: &Path) -> Result<Vec<Chunk>> {
        let naming = ChunkNaming::for_source(source);
        let mut found: Vec<(u32, PathBuf, u64)> = Vec::new();
        for ent in walkdir::WalkDir::new(chunks_dir).min_depth(1).max_depth(1) {
            let ent = ent.map_err(|e| Error::io(format!("list {}", chunks_dir.display()), e.into()))?;
            if !ent.file_type().is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy();
            let Some(index) = naming.parse_index(&name) else { continue };
            if index == 0 || index > self.max_chunks {
                continue;
            }
            let len = ent
                .metadata()
                .map_err(|e| Error::io(format!("stat {}", ent.path().display()), e.into()))?
                .len();
            found.push((index, ent.path().to_path_buf(), len));
        }
        found.sort_by_key(|(i, _, _)| *i);

        if found.is_empty() {
            return Err(Error::io(
                format!("discover chunks of {} in {}", source.display(), chunks_dir.display()),
                std::io::Error::new(ErrorKind::NotFound, "no chunk files found; run split first"),
            ));
        }
        let mut chunks = Vec::with_capacity(found.len());
        for (pos, (index, path, size)) in found.into_iter().enumerate() {
            let expected = pos as u32 + 1;
            if index != expected {
                return Err(Error::io(
                    format!("discover chunks in {}", chunks_dir.display()),
                    std::io::Error::new(
                        ErrorKind::NotFound,
                        format!("missing chunk file {}", naming.file_name(expected)),
                    ),
                ));
            }
            chunks.push(Chunk { index, source_path: path, size });
        }
        Ok(chunks)
    }
}

/// Fill `buf` as far as the reader allows; a short count means end of input.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_roundtrip() {
        let n = ChunkNaming::for_source(Path::new("data/test-4gb.dat"));
        assert_eq!(n.file_name(3), "test-4gb-part-03.dat");
        assert_eq!(n.parse_index("test-4gb-part-03.dat"), Some(3));
        assert_eq!(n.parse_index("test-4gb-part-123.dat"), Some(123));
        assert_eq!(n.parse_index("test-4gb-part-3.dat"), None);
        assert_eq!(n.parse_index("other-part-03.dat"), None);
        assert_eq!(n.parse_index("manifest.json"), None);
    }

    #[test]
    fn naming_without_extension() {
        let n = ChunkNaming::for_source(Path::new("blob"));
        assert_eq!(n.file_name(1), "blob-part-01");
        assert_eq!(n.parse_index("blob-part-01"), Some(1));
    }

    #[test]
    fn read_full_collects_short_reads() {
        struct Trickle<'a>(&'a [u8]);
        impl Read for Trickle<'_> {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0.is_empty() || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = self.0[0];
                self.0 = &self.0[1..];
                Ok(1)
            }
        }
        let mut r = Trickle(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut r, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(read_full(&mut r, &mut buf).unwrap(), 2);
    }

    #[test]
    fn read_error_keeps_written_chunks() {
        struct Failing {
            served: usize,
        }
        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.served >= 4 {
                    return Err(std::io::Error::other("disk went away"));
                }
                let n = buf.len().min(4 - self.served);
                buf[..n].fill(b'x');
                self.served += n;
                Ok(n)
            }
        }

        let td = tempfile::tempdir().unwrap();
        let dir = td.path().join("chunks");
        let naming = ChunkNaming::for_source(Path::new("in.bin"));
        let err = Chunker::new(4, 10).unwrap().split_reader(Failing { served: 0 }, &naming, &dir).unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err}");
        assert!(err.to_string().contains("read chunk 2"), "{err}");
        assert_eq!(fs::read(dir.join("in-part-01.bin")).unwrap(), b"xxxx");
        assert!(!dir.join("in-part-02.bin").exists());
    }

    #[test]
    fn read_error_past_max_chunks_is_not_fatal() {
        struct ThenFail(usize);
        impl Read for ThenFail {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0 == 0 {
                    return Err(std::io::Error::other("late failure"));
                }
                let n = buf.len().min(self.0);
                buf[..n].fill(7);
                self.0 -= n;
                Ok(n)
            }
        }

        let td = tempfile::tempdir().unwrap();
        let dir = td.path().join("chunks");
        let naming = ChunkNaming::for_source(Path::new("in.bin"));
        let chunks = Chunker::new(4, 2).unwrap().split_reader(ThenFail(8), &naming, &dir).unwrap();
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn zero_sizes_rejected() {
        assert!(matches!(Chunker::new(0, 10), Err(Error::InvalidConfig(_))));
        assert!(matches!(Chunker::new(400, 0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn shorter_resplit_clears_leftovers() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("in.bin");
        let dir = td.path().join("chunks");
        let ch = Chunker::new(400, 10).unwrap();

        fs::write(&src, vec![1u8; 1000]).unwrap();
        let first = ch.split(&src, &dir).unwrap();
        assert_eq!(first.iter().map(|c| c.size).collect::<Vec<_>>(), vec![400, 400, 200]);

        fs::write(&src, vec![2u8; 500]).unwrap();
        ch.split(&src, &dir).unwrap();
        assert!(!dir.join("in-part-03.bin").exists());
        let found = ch.discover(&src, &dir).unwrap();
        assert_eq!(found.iter().map(|c| c.size).collect::<Vec<_>>(), vec![400, 100]);
    }

    #[test]
    fn discover_reports_gaps_and_absence() {
        let td = tempfile::tempdir().unwrap();
        let src = td.path().join("in.bin");
        let dir = td.path().join("chunks");
        let ch = Chunker::new(4, 10).unwrap();
        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(ch.discover(&src, &dir), Err(Error::Io { .. })));

        fs::write(dir.join("in-part-01.bin"), b"abcd").unwrap();
        fs::write(dir.join("in-part-03.bin"), b"ij").unwrap();
        let err = ch.discover(&src, &dir).unwrap_err();
        assert!(err.to_string().contains("in-part-02.bin"), "{err}");
    }
}
