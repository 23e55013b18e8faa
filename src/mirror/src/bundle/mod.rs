//! Chunked bundle transport.
//!
//! A bundle is one GNU tar stream of the work directory split across
//! `<base>.0000.chunk`, `<base>.0001.chunk`, ... with optional
//! `<chunk>.gostsum` Stribog sidecars.

mod chunked;
mod pack;
mod unpack;

use std::path::{Path, PathBuf};

use d8_mirror_core::error::Result;

pub use chunked::{stribog_file, ChunkInfo, ChunkReader, ChunkWriter};
pub use pack::{BundlePacker, PackOptions, PackSummary};
pub use unpack::{BundleUnpacker, UnpackSummary};

const CHUNK_SUFFIX: &str = ".chunk";
const GOSTSUM_SUFFIX: &str = ".gostsum";

/// `<base>.NNNN.chunk`
pub fn chunk_path(base: &Path, index: usize) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{:04}{}", index, CHUNK_SUFFIX));
    PathBuf::from(name)
}

/// `<chunk>.gostsum`
pub fn gostsum_path(chunk: &Path) -> PathBuf {
    let mut name = chunk.as_os_str().to_owned();
    name.push(GOSTSUM_SUFFIX);
    PathBuf::from(name)
}

/// Existing chunk files of `base`, in lexical order.
pub fn list_chunks(base: &Path) -> Result<Vec<PathBuf>> {
    let Some(prefix) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Ok(Vec::new());
    };
    let dir = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut chunks = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_chunk_name(&prefix, &name) && entry.file_type()?.is_file() {
            chunks.push(dir.join(&name));
        }
    }
    chunks.sort();
    Ok(chunks)
}

/// Whether `name` is `<prefix>.NNNN.chunk`.
fn is_chunk_name(prefix: &str, name: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(CHUNK_SUFFIX))
        .map_or(false, |index| {
            index.len() >= 4 && index.chars().all(|c| c.is_ascii_digit())
        })
}

/// Whether `path` is a chunk or sidecar of the bundle at `base`.
fn is_bundle_file(base: &Path, path: &Path) -> bool {
    let (Some(prefix), Some(name)) = (base.file_name(), path.file_name()) else {
        return false;
    };
    if base.parent() != path.parent() {
        return false;
    }
    let prefix = prefix.to_string_lossy();
    let name = name.to_string_lossy();
    let stem = name.strip_suffix(GOSTSUM_SUFFIX).unwrap_or(&*name);
    is_chunk_name(&prefix, stem)
}
