//! Registry transport.
//!
//! The engine talks to registries only through the [`Registry`] trait so the
//! same pipeline runs against a real OCI distribution endpoint
//! ([`OciRegistry`]) or an in-process one (`MemoryRegistry`, behind the
//! `test-utils` feature).

mod client;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use async_trait::async_trait;
use d8_mirror_core::error::{MirrorError, Result};
use oci_distribution::manifest::{
    OciImageIndex, OciImageManifest, IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use sha2::{Digest, Sha256};

use crate::reference::ImageReference;

pub use client::{OciRegistry, TransportOptions};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryRegistry;

/// OS every mirrored image is pinned to.
pub const PLATFORM_OS: &str = "linux";

/// Architecture every mirrored image is pinned to.
pub const PLATFORM_ARCH: &str = "amd64";

/// Manifest media types accepted from registries.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    OCI_IMAGE_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
];

/// Content descriptor of a config or layer blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// A blob together with its content.
#[derive(Debug, Clone)]
pub struct Blob {
    pub descriptor: BlobDescriptor,
    pub data: Vec<u8>,
}

impl Blob {
    /// Wrap `data`, computing its digest.
    pub fn new(media_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            descriptor: BlobDescriptor {
                media_type: media_type.into(),
                digest: sha256_digest(&data),
                size: data.len() as u64,
            },
            data,
        }
    }
}

/// Manifest bytes exactly as served by the registry.
///
/// The bytes are never re-serialized so the digest survives a mirror cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub media_type: String,
    pub digest: String,
    pub bytes: Vec<u8>,
}

impl RawManifest {
    /// Wrap manifest bytes, taking the media type from the document.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let media_type = serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| {
                if let Some(media_type) = v.get("mediaType").and_then(|m| m.as_str()) {
                    Some(media_type.to_string())
                } else if v.get("manifests").is_some() {
                    Some(OCI_IMAGE_INDEX_MEDIA_TYPE.to_string())
                } else {
                    None
                }
            })
            .unwrap_or_else(|| OCI_IMAGE_MEDIA_TYPE.to_string());
        Self {
            media_type,
            digest: sha256_digest(&bytes),
            bytes,
        }
    }

    pub fn is_index(&self) -> bool {
        self.media_type == OCI_IMAGE_INDEX_MEDIA_TYPE
            || self.media_type == IMAGE_MANIFEST_LIST_MEDIA_TYPE
    }

    /// Config and layer descriptors of an image manifest.
    pub fn blobs(&self) -> Result<(BlobDescriptor, Vec<BlobDescriptor>)> {
        if self.is_index() {
            return Err(MirrorError::Other(format!(
                "manifest {} is an index, not an image",
                self.digest
            )));
        }
        let manifest: OciImageManifest = serde_json::from_slice(&self.bytes)?;
        let convert = |d: &oci_distribution::manifest::OciDescriptor| BlobDescriptor {
            media_type: d.media_type.clone(),
            digest: d.digest.clone(),
            size: d.size.max(0) as u64,
        };
        let config = convert(&manifest.config);
        let layers = manifest.layers.iter().map(convert).collect();
        Ok((config, layers))
    }

    /// Digest of the `linux/amd64` entry of an index.
    pub fn platform_digest(&self) -> Result<Option<String>> {
        let index: OciImageIndex = serde_json::from_slice(&self.bytes)?;
        Ok(index
            .manifests
            .iter()
            .find(|entry| {
                entry.platform.as_ref().map_or(false, |p| {
                    p.os == PLATFORM_OS && p.architecture == PLATFORM_ARCH
                })
            })
            .map(|entry| entry.digest.clone()))
    }
}

/// Operations the engine needs from a registry.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a reference to its manifest digest (HEAD).
    async fn head_manifest(&self, reference: &ImageReference) -> Result<String>;

    /// List tags of a repository given as `host/path`.
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>>;

    /// Fetch manifest bytes for a reference.
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RawManifest>;

    /// Fetch the content of a blob in the reference's repository.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &BlobDescriptor,
    ) -> Result<Vec<u8>>;

    /// Upload a blob to the reference's repository.
    async fn push_blob(&self, reference: &ImageReference, blob: &Blob) -> Result<()>;

    /// Upload a manifest under the reference's tag or digest.
    async fn push_manifest(&self, reference: &ImageReference, manifest: &RawManifest) -> Result<()>;
}

/// Fetch the image manifest for `reference`, flattening an index to its
/// `linux/amd64` entry.
pub async fn fetch_platform_manifest(
    registry: &dyn Registry,
    reference: &ImageReference,
) -> Result<RawManifest> {
    let manifest = registry.fetch_manifest(reference).await?;
    if !manifest.is_index() {
        return Ok(manifest);
    }

    let digest = manifest.platform_digest()?.ok_or_else(|| {
        MirrorError::ImageNotFound(format!(
            "{} has no {}/{} manifest",
            reference, PLATFORM_OS, PLATFORM_ARCH
        ))
    })?;
    tracing::debug!(
        reference = %reference,
        digest = %digest,
        "Flattened image index to platform manifest"
    );
    let resolved = registry.fetch_manifest(&reference.with_digest(&digest)).await?;
    if resolved.is_index() {
        return Err(MirrorError::Other(format!(
            "{}: nested image index {}",
            reference, digest
        )));
    }
    Ok(resolved)
}

/// Fetch a whole image (manifest, config and layers) into memory.
pub async fn fetch_image(
    registry: &dyn Registry,
    reference: &ImageReference,
) -> Result<(RawManifest, Vec<Blob>)> {
    let manifest = fetch_platform_manifest(registry, reference).await?;
    let (config, layers) = manifest.blobs()?;
    let mut blobs = Vec::with_capacity(layers.len() + 1);
    for descriptor in std::iter::once(config).chain(layers) {
        let data = registry.fetch_blob(reference, &descriptor).await?;
        verify_digest(&descriptor.digest, &data)?;
        blobs.push(Blob { descriptor, data });
    }
    Ok((manifest, blobs))
}

/// `sha256:<hex>` of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Check that `data` hashes to `digest`.
pub fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let actual = sha256_digest(data);
    if actual != digest {
        return Err(MirrorError::Other(format!(
            "content digest mismatch: expected {}, got {}",
            digest, actual
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_manifest_media_type_from_document() {
        let bytes = br#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"mediaType":"a","digest":"sha256:00","size":1},"layers":[]}"#;
        let manifest = RawManifest::from_bytes(bytes.to_vec());
        assert_eq!(manifest.media_type, IMAGE_MANIFEST_MEDIA_TYPE);
        assert!(!manifest.is_index());
        assert_eq!(manifest.digest, sha256_digest(bytes));
    }

    #[test]
    fn test_raw_manifest_index_without_media_type() {
        let bytes = br#"{"schemaVersion":2,"manifests":[]}"#;
        let manifest = RawManifest::from_bytes(bytes.to_vec());
        assert!(manifest.is_index());
    }

    #[test]
    fn test_platform_digest_selects_linux_amd64() {
        let bytes = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_IMAGE_INDEX_MEDIA_TYPE,
            "manifests": [
                {"mediaType": OCI_IMAGE_MEDIA_TYPE, "digest": "sha256:arm", "size": 1,
                 "platform": {"architecture": "arm64", "os": "linux"}},
                {"mediaType": OCI_IMAGE_MEDIA_TYPE, "digest": "sha256:amd", "size": 1,
                 "platform": {"architecture": "amd64", "os": "linux"}}
            ]
        }))
        .unwrap();
        let manifest = RawManifest::from_bytes(bytes);
        assert_eq!(manifest.platform_digest().unwrap(), Some("sha256:amd".to_string()));
    }

    #[test]
    fn test_verify_digest() {
        let digest = sha256_digest(b"hello");
        assert!(verify_digest(&digest, b"hello").is_ok());
        assert!(verify_digest(&digest, b"hello!").is_err());
    }
}
