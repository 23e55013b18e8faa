//! Size-bounded chunk files.
//!
//! [`ChunkWriter`] is a streaming sink that rolls over to a new
//! `<base>.NNNN.chunk` file every `chunk_size` bytes, optionally hashing each
//! chunk with Stribog into a `.gostsum` sidecar. [`ChunkReader`] reads the
//! chunks back as one stream.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use d8_mirror_core::event::{events, EventEmitter, MirrorEvent};
use streebog::{Digest, Streebog256};

use super::{chunk_path, gostsum_path};

/// A finished chunk file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub path: PathBuf,
    pub size: u64,
    /// Hex Stribog-256 digest, when sidecars are written
    pub gostsum: Option<String>,
}

struct OpenChunk {
    path: PathBuf,
    file: BufWriter<File>,
    written: u64,
    hasher: Option<Streebog256>,
}

/// Writer splitting its input across chunk files.
///
/// A chunk is only opened once a byte is written to it, so no empty trailing
/// chunk is produced when the input is an exact multiple of the chunk size.
pub struct ChunkWriter {
    base: PathBuf,
    chunk_size: u64,
    secondary_digests: bool,
    next_index: usize,
    current: Option<OpenChunk>,
    finished: Vec<ChunkInfo>,
    events: EventEmitter,
}

impl ChunkWriter {
    pub fn new(base: &Path, chunk_size: u64, secondary_digests: bool, events: EventEmitter) -> Self {
        Self {
            base: base.to_path_buf(),
            chunk_size: chunk_size.max(1),
            secondary_digests,
            next_index: 0,
            current: None,
            finished: Vec::new(),
            events,
        }
    }

    /// Close the last chunk and return every chunk written.
    pub fn finish(mut self) -> io::Result<Vec<ChunkInfo>> {
        self.close_current()?;
        Ok(self.finished)
    }

    fn open_next(&mut self) -> io::Result<()> {
        let path = chunk_path(&self.base, self.next_index);
        self.next_index += 1;
        let file = File::create(&path)?;
        self.current = Some(OpenChunk {
            path,
            file: BufWriter::new(file),
            written: 0,
            hasher: self.secondary_digests.then(Streebog256::new),
        });
        Ok(())
    }

    fn close_current(&mut self) -> io::Result<()> {
        let Some(chunk) = self.current.take() else {
            return Ok(());
        };
        let file = chunk.file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let gostsum = match chunk.hasher {
            Some(hasher) => {
                let sum = hex::encode(hasher.finalize());
                std::fs::write(gostsum_path(&chunk.path), &sum)?;
                Some(sum)
            }
            None => None,
        };

        tracing::debug!(chunk = %chunk.path.display(), size = chunk.written, "Wrote chunk");
        self.events.emit(MirrorEvent::with_fields(
            events::BUNDLE_CHUNK,
            [
                ("chunk", serde_json::json!(chunk.path.display().to_string())),
                ("size", serde_json::json!(chunk.written)),
            ],
        ));
        self.finished.push(ChunkInfo {
            path: chunk.path,
            size: chunk.written,
            gostsum,
        });
        Ok(())
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let full = self
            .current
            .as_ref()
            .map_or(true, |chunk| chunk.written >= self.chunk_size);
        if full {
            self.close_current()?;
            self.open_next()?;
        }

        let chunk_size = self.chunk_size;
        let chunk = self
            .current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no open chunk"))?;
        let room = (chunk_size - chunk.written) as usize;
        let n = room.min(buf.len());
        chunk.file.write_all(&buf[..n])?;
        if let Some(hasher) = chunk.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        chunk.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(chunk) => chunk.file.flush(),
            None => Ok(()),
        }
    }
}

/// Reader over the concatenation of chunk files, in the given order.
pub struct ChunkReader {
    paths: std::vec::IntoIter<PathBuf>,
    current: Option<File>,
}

impl ChunkReader {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths: paths.into_iter(),
            current: None,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.current.is_none() {
                match self.paths.next() {
                    Some(path) => self.current = Some(File::open(path)?),
                    None => return Ok(0),
                }
            }
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
            }
            self.current = None;
        }
    }
}

/// Hex Stribog-256 digest of a file.
pub fn stribog_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Streebog256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
