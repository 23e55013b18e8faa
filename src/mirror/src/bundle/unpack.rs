use std::fs::OpenOptions;
use std::io;
use std::path::{Component, Path, PathBuf};

use d8_mirror_core::error::{MirrorError, Result};
use d8_mirror_core::event::{events, EventEmitter, MirrorEvent};
use tokio_util::sync::CancellationToken;

use super::{gostsum_path, list_chunks, stribog_file, ChunkReader};

/// What an unpack restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    pub files: usize,
    pub chunks: usize,
}

/// Restores a chunked bundle into a directory.
pub struct BundleUnpacker {
    events: EventEmitter,
    cancel: CancellationToken,
}

impl BundleUnpacker {
    pub fn new(events: EventEmitter, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Verify the chunks of `bundle` and extract them under `work_dir`.
    ///
    /// Chunks whose `.gostsum` sidecar exists are checked before any file is
    /// written. Chunks without a sidecar are accepted as they are.
    pub fn unpack(&self, bundle: &Path, work_dir: &Path) -> Result<UnpackSummary> {
        let chunks = list_chunks(bundle)?;
        if chunks.is_empty() {
            return Err(MirrorError::Bundle(format!(
                "no chunks found for bundle {}",
                bundle.display()
            )));
        }
        for chunk in &chunks {
            self.verify_chunk(chunk)?;
        }

        tracing::info!(
            bundle = %bundle.display(),
            work_dir = %work_dir.display(),
            chunks = chunks.len(),
            "Unpacking bundle"
        );
        create_dir(work_dir)?;

        let chunk_count = chunks.len();
        let mut archive = tar::Archive::new(ChunkReader::new(chunks));
        let mut files = 0;
        let entries = archive
            .entries()
            .map_err(|e| MirrorError::Bundle(format!("unreadable tar stream: {}", e)))?;
        for entry in entries {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            let mut entry =
                entry.map_err(|e| MirrorError::Bundle(format!("corrupt tar entry: {}", e)))?;
            if entry.header().entry_type() != tar::EntryType::Regular {
                continue;
            }
            let name = entry
                .path()
                .map_err(|e| MirrorError::Bundle(format!("bad entry name: {}", e)))?
                .into_owned();
            let target = work_dir.join(safe_relative(&name)?);
            if let Some(parent) = target.parent() {
                create_dir(parent)?;
            }

            let mut file = open_for_write(&target)?;
            let size = io::copy(&mut entry, &mut file)?;
            file.sync_all()?;
            files += 1;
            self.events.emit(MirrorEvent::with_fields(
                events::BUNDLE_FILE,
                [
                    ("file", serde_json::json!(name.display().to_string())),
                    ("size", serde_json::json!(size)),
                ],
            ));
        }

        tracing::info!(files, chunks = chunk_count, "Unpacked bundle");
        Ok(UnpackSummary {
            files,
            chunks: chunk_count,
        })
    }

    fn verify_chunk(&self, chunk: &Path) -> Result<()> {
        let sidecar = gostsum_path(chunk);
        let expected = match std::fs::read_to_string(&sidecar) {
            Ok(sum) => sum.trim().to_ascii_lowercase(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(chunk = %chunk.display(), "No gostsum sidecar, skipping check");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let actual = stribog_file(chunk)?;
        if actual != expected {
            return Err(MirrorError::ChunkDigestMismatch {
                chunk: chunk.display().to_string(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}

/// Entry names must stay inside the target directory.
fn safe_relative(name: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(MirrorError::Bundle(format!(
                    "entry {} escapes the target directory",
                    name.display()
                )));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(MirrorError::Bundle("empty entry name".to_string()));
    }
    Ok(relative)
}

#[cfg(unix)]
fn create_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    Ok(())
}

fn open_for_write(path: &Path) -> io::Result<std::fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o666);
    }
    options.open(path)
}
