//! `DeckhouseRelease` manifests for mirrored versions.

use std::collections::BTreeMap;
use std::path::Path;

use d8_mirror_core::error::{MirrorError, Result};
use serde::Serialize;

use crate::layout::{ImageLayout, IndexEntry};
use crate::release::{parse_version, version_tag, ReleaseInfo};

const API_VERSION: &str = "deckhouse.io/v1alpha1";
const KIND: &str = "DeckhouseRelease";
const CHANGELOG_LINK_BASE: &str = "https://github.com/deckhouse/deckhouse/releases/tag";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeckhouseRelease {
    api_version: &'static str,
    kind: &'static str,
    metadata: Metadata,
    spec: ReleaseSpec,
}

#[derive(Debug, Serialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseSpec {
    version: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    requirements: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disruptions: Option<Vec<String>>,
    changelog: serde_yaml::Value,
    changelog_link: String,
}

impl DeckhouseRelease {
    fn from_info(info: &ReleaseInfo) -> Self {
        let tag = info.tag();
        Self {
            api_version: API_VERSION,
            kind: KIND,
            metadata: Metadata { name: tag.clone() },
            spec: ReleaseSpec {
                version: tag.clone(),
                requirements: info.requirements.clone(),
                disruptions: info.disruptions_for_minor().cloned(),
                changelog: info.changelog.clone(),
                changelog_link: format!("{}/{}", CHANGELOG_LINK_BASE, tag),
            },
        }
    }
}

/// Renders release manifests from a release-channel layout.
pub struct ReleaseManifestGenerator<'a> {
    layout: &'a ImageLayout,
}

impl<'a> ReleaseManifestGenerator<'a> {
    pub fn new(layout: &'a ImageLayout) -> Self {
        Self { layout }
    }

    /// One `---`-prefixed document per version, in the order given.
    pub fn render(&self, versions: &[semver::Version]) -> Result<String> {
        let mut out = String::new();
        for version in versions {
            let entry = self.entry_for(version)?;
            let info = ReleaseInfo::from_layout(self.layout, entry)?;
            let document = serde_yaml::to_string(&DeckhouseRelease::from_info(&info))?;
            out.push_str("---\n");
            out.push_str(&document);
        }
        Ok(out)
    }

    /// Render `versions` into the file at `path`.
    pub fn write(&self, path: &Path, versions: &[semver::Version]) -> Result<()> {
        let rendered = self.render(versions)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, rendered)?;
        tracing::info!(path = %path.display(), releases = versions.len(), "Wrote release manifests");
        Ok(())
    }

    /// Versions tagged in the layout, ascending. Channel tags are ignored.
    pub fn layout_versions(&self) -> Vec<semver::Version> {
        let mut versions: Vec<semver::Version> = self
            .layout
            .entries()
            .iter()
            .filter_map(|entry| entry.short_tag())
            .filter(|tag| tag.starts_with('v'))
            .filter_map(parse_version)
            .collect();
        versions.sort();
        versions.dedup();
        versions
    }

    fn entry_for(&self, version: &semver::Version) -> Result<&'a IndexEntry> {
        let tag = version_tag(version);
        self.layout
            .entries()
            .iter()
            .find(|entry| entry.short_tag() == Some(tag.as_str()))
            .ok_or_else(|| {
                MirrorError::ImageNotFound(format!(
                    "{} in {}",
                    tag,
                    self.layout.path().display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::build_image;
    use crate::layout::pull_annotations;
    use crate::reference::ImageReference;
    use crate::registry::Blob;
    use tempfile::TempDir;

    fn add_release(layout: &mut ImageLayout, tag: &str, version_json: &str, changelog: &str) {
        let image = build_image(&[
            ("version.json", version_json.as_bytes()),
            ("changelog.yaml", changelog.as_bytes()),
        ])
        .unwrap();
        let blobs: Vec<Blob> = image.blobs().cloned().collect();
        let reference = ImageReference::parse(&format!("r.example.com/d8/release-channel:{tag}")).unwrap();
        layout
            .append_image(&image.manifest, &blobs, pull_annotations(&reference, &image.manifest.digest))
            .unwrap();
    }

    fn version(s: &str) -> semver::Version {
        semver::Version::parse(s).unwrap()
    }

    #[test]
    fn test_render_fields() {
        let tmp = TempDir::new().unwrap();
        let mut layout = ImageLayout::create_empty(tmp.path()).unwrap();
        add_release(
            &mut layout,
            "v1.56.5",
            r#"{"version":"v1.56.5","requirements":{"k8s":"1.25"},"disruptions":{"1.56":["ingressNginx"]}}"#,
            "candi:\n  fixes:\n  - summary: fix\n",
        );

        let rendered = ReleaseManifestGenerator::new(&layout)
            .render(&[version("1.56.5")])
            .unwrap();
        assert!(rendered.starts_with("---\n"));
        let doc: serde_yaml::Value = serde_yaml::from_str(rendered.trim_start_matches("---\n")).unwrap();
        assert_eq!(doc["apiVersion"], "deckhouse.io/v1alpha1");
        assert_eq!(doc["kind"], "DeckhouseRelease");
        assert_eq!(doc["metadata"]["name"], "v1.56.5");
        assert_eq!(doc["spec"]["requirements"]["k8s"], "1.25");
        assert_eq!(doc["spec"]["disruptions"][0], "ingressNginx");
        assert_eq!(doc["spec"]["changelog"]["candi"]["fixes"][0]["summary"], "fix");
    }

    #[test]
    fn test_missing_version_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let layout = ImageLayout::create_empty(tmp.path()).unwrap();
        let err = ReleaseManifestGenerator::new(&layout)
            .render(&[version("1.0.0")])
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_layout_versions_skip_channels() {
        let tmp = TempDir::new().unwrap();
        let mut layout = ImageLayout::create_empty(tmp.path()).unwrap();
        add_release(&mut layout, "v1.56.5", r#"{"version":"v1.56.5"}"#, "");
        add_release(&mut layout, "alpha", r#"{"version":"v1.56.5"}"#, "");
        add_release(&mut layout, "v1.55.7", r#"{"version":"v1.55.7"}"#, "");

        let versions = ReleaseManifestGenerator::new(&layout).layout_versions();
        assert_eq!(versions, vec![version("1.55.7"), version("1.56.5")]);
    }
}
