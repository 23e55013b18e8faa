//! Layout integrity checks.

use std::fmt;
use std::path::PathBuf;

use d8_mirror_core::config::ValidationMode;
use d8_mirror_core::error::{MirrorError, Result};
use d8_mirror_core::event::{events, EventEmitter, MirrorEvent};

use crate::layout::{ImageLayout, IndexEntry};
use crate::registry::sha256_digest;

/// One inconsistency found in a layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutProblem {
    pub layout: PathBuf,
    pub problem: String,
}

impl fmt::Display for LayoutProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.layout.display(), self.problem)
    }
}

/// Checks layouts according to a [`ValidationMode`].
pub struct Validator {
    mode: ValidationMode,
    events: EventEmitter,
}

impl Validator {
    pub fn new(mode: ValidationMode, events: EventEmitter) -> Self {
        Self { mode, events }
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Every problem found in `layout`.
    pub fn validate(&self, layout: &ImageLayout) -> Vec<LayoutProblem> {
        if self.mode == ValidationMode::Off {
            return Vec::new();
        }

        let mut problems = Vec::new();
        for entry in layout.entries() {
            let name = entry.reference().unwrap_or(&entry.digest).to_string();
            if let Err(problem) = self.check_entry(layout, entry) {
                problems.push(LayoutProblem {
                    layout: layout.path().to_path_buf(),
                    problem: format!("{}: {}", name, problem),
                });
            }
        }

        self.events.emit(MirrorEvent::with_fields(
            events::LAYOUT_VALIDATED,
            [
                ("layout", serde_json::json!(layout.path().display().to_string())),
                ("mode", serde_json::json!(self.mode.to_string())),
                ("manifests", serde_json::json!(layout.entries().len())),
                ("problems", serde_json::json!(problems.len())),
            ],
        ));
        problems
    }

    /// Validate several layouts and fail with [`MirrorError::LayoutInvalid`]
    /// when any problem is found.
    pub fn ensure_valid<'a, I>(&self, layouts: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a ImageLayout>,
    {
        let problems: Vec<LayoutProblem> = layouts
            .into_iter()
            .flat_map(|layout| self.validate(layout))
            .collect();
        if problems.is_empty() {
            return Ok(());
        }
        for problem in &problems {
            tracing::error!(layout = %problem.layout.display(), problem = %problem.problem, "Layout problem");
        }
        Err(MirrorError::LayoutInvalid(
            problems.iter().map(ToString::to_string).collect(),
        ))
    }

    fn check_entry(&self, layout: &ImageLayout, entry: &IndexEntry) -> std::result::Result<(), String> {
        if !layout.has_blob(&entry.digest) {
            return Err(format!("manifest blob {} is missing", entry.digest));
        }
        let manifest = layout
            .read_manifest(entry)
            .map_err(|e| format!("cannot read manifest: {}", e))?;
        if manifest.is_index() {
            return Err("nested image index".to_string());
        }
        let (config, layers) = manifest
            .blobs()
            .map_err(|e| format!("malformed manifest: {}", e))?;

        for descriptor in std::iter::once(&config).chain(layers.iter()) {
            if !layout.has_blob(&descriptor.digest) {
                return Err(format!("blob {} is missing", descriptor.digest));
            }
        }

        if self.mode != ValidationMode::Full {
            return Ok(());
        }

        if manifest.digest != entry.digest {
            return Err(format!(
                "manifest content hashes to {}, recorded as {}",
                manifest.digest, entry.digest
            ));
        }
        if manifest.bytes.len() as u64 != entry.size {
            return Err(format!(
                "manifest size {} differs from recorded {}",
                manifest.bytes.len(),
                entry.size
            ));
        }
        let mut config_data = Vec::new();
        for descriptor in std::iter::once(&config).chain(layers.iter()) {
            let data = layout
                .read_blob(&descriptor.digest)
                .map_err(|e| e.to_string())?;
            let actual = sha256_digest(&data);
            if actual != descriptor.digest {
                return Err(format!(
                    "blob {} content hashes to {}",
                    descriptor.digest, actual
                ));
            }
            if data.len() as u64 != descriptor.size {
                return Err(format!(
                    "blob {} is {} bytes, manifest says {}",
                    descriptor.digest,
                    data.len(),
                    descriptor.size
                ));
            }
            if descriptor.digest == config.digest {
                config_data = data;
            }
        }
        check_config(&config_data, layers.len())
    }
}

/// The config must parse, and when it lists diff IDs they must match the
/// layer count.
fn check_config(data: &[u8], layer_count: usize) -> std::result::Result<(), String> {
    let config: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| format!("image config does not parse: {}", e))?;
    if let Some(diff_ids) = config
        .get("rootfs")
        .and_then(|rootfs| rootfs.get("diff_ids"))
        .and_then(|ids| ids.as_array())
    {
        if diff_ids.len() != layer_count {
            return Err(format!(
                "image config lists {} diff_ids for {} layers",
                diff_ids.len(),
                layer_count
            ));
        }
    }
    Ok(())
}
