use std::fs::{File, Metadata};
use std::path::{Path, PathBuf};

use d8_mirror_core::config::{MirrorContext, DEFAULT_CHUNK_SIZE};
use d8_mirror_core::error::{MirrorError, Result};
use d8_mirror_core::event::{events, EventEmitter, MirrorEvent};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{is_bundle_file, ChunkInfo, ChunkWriter};

/// How a bundle is written.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Bytes per chunk file
    pub chunk_size: u64,
    /// Write a `.gostsum` sidecar per chunk
    pub secondary_digests: bool,
    /// Delete each source file once it is in the stream
    pub remove_packed_files: bool,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            secondary_digests: true,
            remove_packed_files: true,
        }
    }
}

impl PackOptions {
    pub fn from_context(ctx: &MirrorContext) -> Self {
        Self {
            chunk_size: ctx.chunk_size,
            secondary_digests: !ctx.skip_secondary_digests,
            remove_packed_files: true,
        }
    }
}

/// What a pack produced.
#[derive(Debug, Clone, Default)]
pub struct PackSummary {
    pub chunks: Vec<ChunkInfo>,
    /// Regular files packed
    pub files: usize,
    /// Total bytes across chunks
    pub bytes: u64,
}

/// Packs a directory tree into chunk files.
pub struct BundlePacker {
    options: PackOptions,
    events: EventEmitter,
    cancel: CancellationToken,
}

impl BundlePacker {
    pub fn new(options: PackOptions, events: EventEmitter, cancel: CancellationToken) -> Self {
        Self {
            options,
            events,
            cancel,
        }
    }

    /// Pack every regular file under `work_dir` into `<bundle>.NNNN.chunk`.
    ///
    /// Entry names are relative to `work_dir`. Files are visited depth-first
    /// in file-name order.
    pub fn pack(&self, work_dir: &Path, bundle: &Path) -> Result<PackSummary> {
        let work_dir = work_dir.canonicalize().map_err(|e| {
            MirrorError::Bundle(format!("work dir {}: {}", work_dir.display(), e))
        })?;
        let bundle = absolute_bundle_path(bundle)?;

        tracing::info!(
            work_dir = %work_dir.display(),
            bundle = %bundle.display(),
            chunk_size = self.options.chunk_size,
            "Packing bundle"
        );

        let writer = ChunkWriter::new(
            &bundle,
            self.options.chunk_size,
            self.options.secondary_digests,
            self.events.clone(),
        );
        let mut builder = tar::Builder::new(writer);
        let mut files = 0;

        for entry in WalkDir::new(&work_dir).sort_by_file_name() {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            let entry = entry.map_err(|e| MirrorError::Bundle(format!("walk failed: {}", e)))?;
            if !entry.file_type().is_file() || is_bundle_file(&bundle, entry.path()) {
                continue;
            }

            let path = entry.path();
            let name = path
                .strip_prefix(&work_dir)
                .map_err(|e| MirrorError::Bundle(format!("{}: {}", path.display(), e)))?;
            let metadata = entry
                .metadata()
                .map_err(|e| MirrorError::Bundle(format!("{}: {}", path.display(), e)))?;

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(file_mode(&metadata));
            header.set_mtime(mtime(&metadata));
            let file = File::open(path)?;
            builder.append_data(&mut header, name, file).map_err(|e| {
                MirrorError::Bundle(format!("failed to append {}: {}", name.display(), e))
            })?;
            files += 1;

            self.events.emit(MirrorEvent::with_fields(
                events::BUNDLE_FILE,
                [
                    ("file", serde_json::json!(name.display().to_string())),
                    ("size", serde_json::json!(metadata.len())),
                ],
            ));

            if self.options.remove_packed_files {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!(file = %path.display(), error = %e, "Failed to remove packed file");
                }
            }
        }

        let writer = builder
            .into_inner()
            .map_err(|e| MirrorError::Bundle(format!("failed to finish tar stream: {}", e)))?;
        let chunks = writer.finish()?;

        if self.options.remove_packed_files {
            remove_empty_dirs(&work_dir);
        }

        let bytes = chunks.iter().map(|c| c.size).sum();
        tracing::info!(chunks = chunks.len(), files, bytes, "Packed bundle");
        Ok(PackSummary {
            chunks,
            files,
            bytes,
        })
    }
}

fn absolute_bundle_path(bundle: &Path) -> Result<PathBuf> {
    let name = bundle
        .file_name()
        .ok_or_else(|| MirrorError::Bundle(format!("bundle path {} has no file name", bundle.display())))?;
    let parent = match bundle.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    Ok(parent.canonicalize()?.join(name))
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

fn mtime(metadata: &Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// Best-effort removal of directories left empty under `root`.
fn remove_empty_dirs(root: &Path) {
    let dirs = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir());
    for dir in dirs {
        let _ = std::fs::remove_dir(dir.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{chunk_path, list_chunks};
    use tempfile::TempDir;

    fn packer(options: PackOptions) -> BundlePacker {
        BundlePacker::new(options, EventEmitter::default(), CancellationToken::new())
    }

    #[test]
    fn test_pack_removes_sources_by_default() {
        let tmp = TempDir::new().unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir_all(work.join("a/b")).unwrap();
        std::fs::write(work.join("a/b/file"), b"content").unwrap();
        std::fs::write(work.join("top"), b"top").unwrap();

        let summary = packer(PackOptions {
            chunk_size: 4096,
            ..Default::default()
        })
        .pack(&work, &tmp.path().join("out/d8.tar"))
        .unwrap();

        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, summary.chunks.iter().map(|c| c.size).sum::<u64>());
        assert!(!work.join("a/b/file").exists());
        assert!(!work.join("a").exists());
        assert!(work.exists());
        assert!(summary.chunks.iter().all(|c| c.gostsum.is_some()));
    }

    #[test]
    fn test_pack_skips_bundle_inside_work_dir() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("data"), vec![7u8; 3000]).unwrap();
        let bundle = tmp.path().join("d8.tar");

        let summary = packer(PackOptions {
            chunk_size: 1024,
            secondary_digests: true,
            remove_packed_files: false,
        })
        .pack(tmp.path(), &bundle)
        .unwrap();

        assert_eq!(summary.files, 1);
        assert_eq!(list_chunks(&bundle).unwrap().len(), summary.chunks.len());
        assert!(tmp.path().join("data").exists());
        assert!(chunk_path(&bundle, 0).exists());
    }

    #[test]
    fn test_pack_cancelled() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("data"), b"x").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let packer = BundlePacker::new(PackOptions::default(), EventEmitter::default(), cancel);
        let err = packer
            .pack(tmp.path(), &tmp.path().join("b.tar"))
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
