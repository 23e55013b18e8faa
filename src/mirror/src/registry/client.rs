//! OCI distribution client.
//!
//! Uses the `oci-distribution` crate to talk to source and destination
//! registries. Manifests travel as raw bytes in both directions.

use async_trait::async_trait;
use d8_mirror_core::config::{MirrorContext, RegistryAuth};
use d8_mirror_core::error::{MirrorError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use super::{Blob, BlobDescriptor, RawManifest, Registry, ACCEPTED_MANIFEST_TYPES};
use crate::reference::ImageReference;

/// Page size used when listing tags.
const TAG_PAGE_SIZE: usize = 1000;

/// Connection settings for one registry endpoint.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub insecure: bool,
    pub skip_tls_verify: bool,
    pub auth: RegistryAuth,
}

impl TransportOptions {
    pub fn from_context(ctx: &MirrorContext) -> Self {
        Self {
            insecure: ctx.insecure,
            skip_tls_verify: ctx.skip_tls_verify,
            auth: ctx.auth.clone(),
        }
    }
}

/// [`Registry`] backed by a remote OCI distribution endpoint.
pub struct OciRegistry {
    client: Client,
    auth: OciRegistryAuth,
}

impl OciRegistry {
    pub fn new(options: &TransportOptions) -> Self {
        let config = ClientConfig {
            protocol: if options.insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: options.skip_tls_verify,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: to_oci_auth(&options.auth),
        }
    }

    pub fn from_context(ctx: &MirrorContext) -> Self {
        Self::new(&TransportOptions::from_context(ctx))
    }

    async fn authenticate_push(&self, reference: &ImageReference, oci_ref: &Reference) -> Result<()> {
        self.client
            .auth(oci_ref, &self.auth, RegistryOperation::Push)
            .await
            .map_err(|e| classify(&reference.to_string(), e))?;
        Ok(())
    }
}

#[async_trait]
impl Registry for OciRegistry {
    async fn head_manifest(&self, reference: &ImageReference) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        self.client
            .fetch_manifest_digest(&oci_ref, &self.auth)
            .await
            .map_err(|e| classify(&reference.to_string(), e))
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let listing = format!("{}:latest", repository.trim_end_matches('/'));
        let oci_ref = listing.parse::<Reference>().map_err(|e| {
            MirrorError::InvalidReference(format!("'{}': {}", repository, e))
        })?;

        let mut tags = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let page = self
                .client
                .list_tags(&oci_ref, &self.auth, Some(TAG_PAGE_SIZE), last.as_deref())
                .await
                .map_err(|e| classify(repository, e))?;
            let count = page.tags.len();
            last = page.tags.last().cloned();
            tags.extend(page.tags);
            if count < TAG_PAGE_SIZE || last.is_none() {
                break;
            }
        }
        tracing::debug!(repository = %repository, count = tags.len(), "Listed tags");
        Ok(tags)
    }

    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        let oci_ref = to_oci_reference(reference)?;
        let (bytes, _digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &self.auth, ACCEPTED_MANIFEST_TYPES)
            .await
            .map_err(|e| classify(&reference.to_string(), e))?;
        Ok(RawManifest::from_bytes(bytes.to_vec()))
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &BlobDescriptor,
    ) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let layer = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: descriptor.size as i64,
            ..Default::default()
        };
        let mut data: Vec<u8> = Vec::with_capacity(descriptor.size as usize);
        self.client
            .pull_blob(&oci_ref, &layer, &mut data)
            .await
            .map_err(|e| classify(&format!("{}@{}", reference.repo(), descriptor.digest), e))?;
        Ok(data)
    }

    async fn push_blob(&self, reference: &ImageReference, blob: &Blob) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        self.authenticate_push(reference, &oci_ref).await?;
        self.client
            .push_blob(&oci_ref, &blob.data, &blob.descriptor.digest)
            .await
            .map_err(|e| classify(&format!("{}@{}", reference.repo(), blob.descriptor.digest), e))?;
        Ok(())
    }

    async fn push_manifest(&self, reference: &ImageReference, manifest: &RawManifest) -> Result<()> {
        let oci_ref = to_oci_reference(reference)?;
        self.authenticate_push(reference, &oci_ref).await?;
        let content_type = http::HeaderValue::from_str(&manifest.media_type).map_err(|e| {
            MirrorError::Other(format!("invalid media type '{}': {}", manifest.media_type, e))
        })?;
        self.client
            .push_manifest_raw(&oci_ref, manifest.bytes.clone(), content_type)
            .await
            .map_err(|e| classify(&reference.to_string(), e))?;
        Ok(())
    }
}

/// Convert to oci-distribution auth type.
///
/// The client only speaks basic credentials, so a bearer token is presented
/// as the password of an anonymous user and exchanged by the registry.
fn to_oci_auth(auth: &RegistryAuth) -> OciRegistryAuth {
    match auth {
        RegistryAuth::Anonymous => OciRegistryAuth::Anonymous,
        RegistryAuth::Basic { username, password } => {
            OciRegistryAuth::Basic(username.clone(), password.clone())
        }
        RegistryAuth::Bearer { token } => OciRegistryAuth::Basic(String::new(), token.clone()),
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}@{}", reference.repo(), digest),
        (None, Some(tag)) => format!("{}:{}", reference.repo(), tag),
        (None, None) => {
            return Err(MirrorError::InvalidReference(format!(
                "'{}': expected a tag or a digest",
                reference.repo()
            )))
        }
    };
    ref_str.parse::<Reference>().map_err(|e| {
        MirrorError::InvalidReference(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Map a client error onto the mirror error taxonomy.
fn classify(reference: &str, err: OciDistributionError) -> MirrorError {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => {
            MirrorError::ImageNotFound(reference.to_string())
        }
        OciDistributionError::UnauthorizedError { .. }
        | OciDistributionError::AuthenticationFailure(_) => MirrorError::Unauthorized {
            reference: reference.to_string(),
            message: err.to_string(),
        },
        other => classify_message(reference, other.to_string()),
    }
}

fn classify_message(reference: &str, message: String) -> MirrorError {
    let upper = message.to_ascii_uppercase();
    if ["MANIFEST_UNKNOWN", "NAME_UNKNOWN", "BLOB_UNKNOWN", "NOT FOUND", "CODE: 404"]
        .iter()
        .any(|marker| upper.contains(marker))
    {
        MirrorError::ImageNotFound(reference.to_string())
    } else if ["UNAUTHORIZED", "DENIED", "CODE: 401", "CODE: 403"]
        .iter()
        .any(|marker| upper.contains(marker))
    {
        MirrorError::Unauthorized {
            reference: reference.to_string(),
            message,
        }
    } else {
        MirrorError::RegistryUnavailable {
            reference: reference.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_to_oci_auth() {
        assert!(matches!(
            to_oci_auth(&RegistryAuth::Anonymous),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            to_oci_auth(&RegistryAuth::basic("user", "pass")),
            OciRegistryAuth::Basic(u, p) if u == "user" && p == "pass"
        ));
        assert!(matches!(
            to_oci_auth(&RegistryAuth::Bearer { token: "t".into() }),
            OciRegistryAuth::Basic(u, p) if u.is_empty() && p == "t"
        ));
    }

    #[test]
    fn test_to_oci_reference_with_tag() {
        let r = ImageReference::parse("ghcr.io/deckhouse/ee/install:v1.56.5").unwrap();
        let oci_ref = to_oci_reference(&r).unwrap();
        assert_eq!(oci_ref.to_string(), "ghcr.io/deckhouse/ee/install:v1.56.5");
    }

    #[test]
    fn test_to_oci_reference_prefers_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/deckhouse/ee:v1@{DIGEST}")).unwrap();
        let oci_ref = to_oci_reference(&r).unwrap();
        assert_eq!(oci_ref.digest(), Some(DIGEST));
    }

    #[test]
    fn test_classify_message() {
        assert!(classify_message("r", "MANIFEST_UNKNOWN: manifest unknown".into()).is_not_found());
        assert!(matches!(
            classify_message("r", "Server error: code: 403, message: denied".into()),
            MirrorError::Unauthorized { .. }
        ));
        assert!(classify_message("r", "connection reset by peer".into()).is_transient());
    }

    #[test]
    fn test_client_builds_for_insecure_transport() {
        let registry = OciRegistry::new(&TransportOptions {
            insecure: true,
            skip_tls_verify: true,
            auth: RegistryAuth::basic("u", "p"),
        });
        assert!(matches!(registry.auth, OciRegistryAuth::Basic(_, _)));
    }
}
