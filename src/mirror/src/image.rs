//! Image content helpers.
//!
//! Reading single files out of layer tarballs (release metadata, component
//! digest lists) and building small single-layer images.

use std::io::{Cursor, Read};

use d8_mirror_core::error::{MirrorError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_distribution::manifest::{IMAGE_LAYER_GZIP_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE};
use sha2::{Digest, Sha256};
use tar::Archive;

use crate::registry::{Blob, RawManifest, PLATFORM_ARCH, PLATFORM_OS};

/// Media type of image config blobs written by [`build_image`].
pub const IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Gzip member magic.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Find `path` inside a layer blob (gzip-compressed or plain tar).
///
/// Leading `./` and `/` are ignored on both sides.
pub fn find_file_in_layer(layer: &[u8], path: &str) -> Result<Option<Vec<u8>>> {
    let wanted = normalize(path);
    let reader: Box<dyn Read + '_> = if layer.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(layer))
    } else {
        Box::new(layer)
    };

    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| MirrorError::Other(format!("Failed to read layer: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| MirrorError::Other(format!("Failed to read layer entry: {}", e)))?;
        let name = entry
            .path()
            .map_err(|e| MirrorError::Other(format!("Bad layer entry path: {}", e)))?
            .to_string_lossy()
            .into_owned();
        if normalize(&name) == wanted && entry.header().entry_type().is_file() {
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

/// Find `path` in a set of layers, the topmost layer winning.
pub fn find_file_in_layers<'a, I>(layers: I, path: &str) -> Result<Option<Vec<u8>>>
where
    I: IntoIterator<Item = &'a [u8]>,
    I::IntoIter: DoubleEndedIterator,
{
    for layer in layers.into_iter().rev() {
        if let Some(data) = find_file_in_layer(layer, path)? {
            return Ok(Some(data));
        }
    }
    Ok(None)
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}

/// A complete image held in memory.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    pub manifest: RawManifest,
    pub config: Blob,
    pub layers: Vec<Blob>,
}

impl BuiltImage {
    /// Config first, then layers.
    pub fn blobs(&self) -> impl Iterator<Item = &Blob> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Build a `linux/amd64` image with a single gzip layer holding `files`.
///
/// Entries carry zero timestamps, so equal input yields equal digests.
pub fn build_image(files: &[(&str, &[u8])]) -> Result<BuiltImage> {
    let tar = build_tar(files)?;
    let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(&tar)));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::copy(&mut Cursor::new(&tar), &mut encoder)?;
    let layer = Blob::new(IMAGE_LAYER_GZIP_MEDIA_TYPE, encoder.finish()?);

    let config = serde_json::json!({
        "architecture": PLATFORM_ARCH,
        "os": PLATFORM_OS,
        "config": {},
        "rootfs": {"type": "layers", "diff_ids": [diff_id]},
    });
    let config = Blob::new(IMAGE_CONFIG_MEDIA_TYPE, serde_json::to_vec(&config)?);

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_IMAGE_MEDIA_TYPE,
        "config": {
            "mediaType": config.descriptor.media_type,
            "digest": config.descriptor.digest,
            "size": config.descriptor.size,
        },
        "layers": [{
            "mediaType": layer.descriptor.media_type,
            "digest": layer.descriptor.digest,
            "size": layer.descriptor.size,
        }],
    });
    let manifest = RawManifest::from_bytes(serde_json::to_vec(&manifest)?);

    Ok(BuiltImage {
        manifest,
        config,
        layers: vec![layer],
    })
}

fn build_tar(files: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        builder.append_data(&mut header, name, *content)?;
    }
    Ok(builder.into_inner()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_file_in_gzip_layer() {
        let image = build_image(&[
            ("version.json", br#"{"version":"v1.56.5"}"#),
            ("deckhouse/candi/images_digests.json", b"{}"),
        ])
        .unwrap();
        let layer = &image.layers[0].data;

        let found = find_file_in_layer(layer, "version.json").unwrap();
        assert_eq!(found.as_deref(), Some(&br#"{"version":"v1.56.5"}"#[..]));
        let nested = find_file_in_layer(layer, "/deckhouse/candi/images_digests.json").unwrap();
        assert_eq!(nested.as_deref(), Some(&b"{}"[..]));
        assert!(find_file_in_layer(layer, "changelog.yaml").unwrap().is_none());
    }

    #[test]
    fn test_find_file_in_plain_tar() {
        let tar = build_tar(&[("./version.json", b"x")]).unwrap();
        assert_eq!(
            find_file_in_layer(&tar, "version.json").unwrap().as_deref(),
            Some(&b"x"[..])
        );
    }

    #[test]
    fn test_topmost_layer_wins() {
        let lower = build_tar(&[("f", b"lower")]).unwrap();
        let upper = build_tar(&[("f", b"upper")]).unwrap();
        let found = find_file_in_layers([lower.as_slice(), upper.as_slice()], "f").unwrap();
        assert_eq!(found.as_deref(), Some(&b"upper"[..]));
    }

    #[test]
    fn test_build_image_is_deterministic() {
        let a = build_image(&[("module", b"admin")]).unwrap();
        let b = build_image(&[("module", b"admin")]).unwrap();
        assert_eq!(a.manifest.digest, b.manifest.digest);

        let (config, layers) = a.manifest.blobs().unwrap();
        assert_eq!(config, a.config.descriptor);
        assert_eq!(layers, vec![a.layers[0].descriptor.clone()]);
    }
}
