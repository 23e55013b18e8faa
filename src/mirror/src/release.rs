//! Release metadata carried by release-channel images.
//!
//! A release-channel image holds `version.json` and optionally
//! `changelog.yaml` at the root of its layer tree.

use std::collections::BTreeMap;

use d8_mirror_core::error::{MirrorError, Result};
use serde::Deserialize;

use crate::layout::{ImageLayout, IndexEntry};

pub const VERSION_FILE: &str = "version.json";
pub const CHANGELOG_FILE: &str = "changelog.yaml";

/// Parsed release metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseInfo {
    pub version: semver::Version,
    pub suspended: bool,
    pub requirements: BTreeMap<String, String>,
    /// Keyed by `major.minor`
    pub disruptions: BTreeMap<String, Vec<String>>,
    pub changelog: serde_yaml::Value,
}

#[derive(Deserialize)]
struct VersionFile {
    version: String,
    #[serde(default)]
    suspend: bool,
    #[serde(default)]
    requirements: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    disruptions: BTreeMap<String, Vec<String>>,
}

impl ReleaseInfo {
    /// Parse `version.json` and an optional `changelog.yaml`.
    ///
    /// `image` names the source image in errors.
    pub fn parse(image: &str, version_json: &[u8], changelog: Option<&[u8]>) -> Result<Self> {
        let corrupt = |reason: String| MirrorError::CorruptReleaseChannel {
            image: image.to_string(),
            reason,
        };

        let file: VersionFile = serde_json::from_slice(version_json)
            .map_err(|e| corrupt(format!("malformed {}: {}", VERSION_FILE, e)))?;
        let version = parse_version(&file.version)
            .ok_or_else(|| corrupt(format!("'{}' is not a semantic version", file.version)))?;

        let requirements = file
            .requirements
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();

        let changelog = match changelog {
            Some(data) if !data.is_empty() => serde_yaml::from_slice(data)
                .map_err(|e| corrupt(format!("malformed {}: {}", CHANGELOG_FILE, e)))?,
            _ => serde_yaml::Value::Mapping(Default::default()),
        };

        Ok(Self {
            version,
            suspended: file.suspend,
            requirements,
            disruptions: file.disruptions,
            changelog,
        })
    }

    /// Read release metadata from an image stored in `layout`.
    pub fn from_layout(layout: &ImageLayout, entry: &IndexEntry) -> Result<Self> {
        let image = entry.reference().unwrap_or(&entry.digest).to_string();
        let version_json = layout.read_image_file(entry, VERSION_FILE)?.ok_or_else(|| {
            MirrorError::CorruptReleaseChannel {
                image: image.clone(),
                reason: format!("missing {}", VERSION_FILE),
            }
        })?;
        let changelog = layout.read_image_file(entry, CHANGELOG_FILE)?;
        Self::parse(&image, &version_json, changelog.as_deref())
    }

    /// `v<version>`
    pub fn tag(&self) -> String {
        version_tag(&self.version)
    }

    /// Disruptions declared for this release's minor version.
    pub fn disruptions_for_minor(&self) -> Option<&Vec<String>> {
        self.disruptions
            .get(&format!("{}.{}", self.version.major, self.version.minor))
    }
}

/// Tag named by the `version` field of a release image's `version.json`.
///
/// Module releases need not be semantic versions; the value is only
/// normalized to carry a `v` prefix.
pub fn release_tag_from_layout(layout: &ImageLayout, entry: &IndexEntry) -> Result<String> {
    let image = entry.reference().unwrap_or(&entry.digest).to_string();
    let corrupt = |reason: String| MirrorError::CorruptReleaseChannel {
        image: image.clone(),
        reason,
    };
    let data = layout
        .read_image_file(entry, VERSION_FILE)?
        .ok_or_else(|| corrupt(format!("missing {}", VERSION_FILE)))?;
    let file: VersionFile = serde_json::from_slice(&data)
        .map_err(|e| corrupt(format!("malformed {}: {}", VERSION_FILE, e)))?;
    let version = file.version.trim();
    if version.is_empty() {
        return Err(corrupt("empty version".to_string()));
    }
    Ok(if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    })
}

/// Parse `1.2.3` or `v1.2.3`.
pub fn parse_version(text: &str) -> Option<semver::Version> {
    let text = text.trim();
    semver::Version::parse(text.strip_prefix('v').unwrap_or(text)).ok()
}

/// Registry tag of a version: `v<version>`.
pub fn version_tag(version: &semver::Version) -> String {
    format!("v{}", version)
}
