//! Image reference parsing.
//!
//! Mirror references always carry an explicit registry host:
//! `registry.example.com/deckhouse/ee/install:v1.56.5` or
//! `registry.example.com/deckhouse/ee@sha256:<hex>`.

use d8_mirror_core::error::{MirrorError, Result};

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    /// Registry hostname, with port if any (e.g., "registry.example.com:5000")
    pub registry: String,
    /// Repository path under the host (e.g., "deckhouse/ee/install")
    pub repository: String,
    /// Tag (e.g., "alpha", "v1.56.5")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `host/repo:tag`
    /// - `host/repo@sha256:hex`
    /// - `host:port/repo:tag@sha256:hex`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(MirrorError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|reason| {
                    MirrorError::InvalidReference(format!("'{}': {}", reference, reason))
                })?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // Tag is the part after the last colon that follows the last slash
        let slash_pos = name_tag.rfind('/').ok_or_else(|| {
            MirrorError::InvalidReference(format!(
                "'{}': reference must include a registry host",
                reference
            ))
        })?;
        let (name, tag) = match name_tag[slash_pos + 1..].rfind(':') {
            Some(colon_pos) => {
                let split = slash_pos + 1 + colon_pos;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if tag.as_deref() == Some("") {
            return Err(MirrorError::InvalidReference(format!(
                "'{}': empty tag",
                reference
            )));
        }
        if tag.is_none() && digest.is_none() {
            return Err(MirrorError::InvalidReference(format!(
                "'{}': expected a tag or a digest",
                reference
            )));
        }

        let (registry, repository) = split_registry_repository(name).ok_or_else(|| {
            MirrorError::InvalidReference(format!(
                "'{}': reference must include a registry host",
                reference
            ))
        })?;

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Tagged reference `<repo>:<tag>`.
    pub fn tagged(repo: &str, tag: &str) -> Result<Self> {
        Self::parse(&format!("{}:{}", repo.trim_end_matches('/'), tag))
    }

    /// Digested reference `<repo>@<digest>`.
    pub fn digested(repo: &str, digest: &str) -> Result<Self> {
        Self::parse(&format!("{}@{}", repo.trim_end_matches('/'), digest))
    }

    /// `registry/repository` without tag or digest.
    pub fn repo(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Whether the reference pins a digest and needs no tag resolution.
    pub fn is_digested(&self) -> bool {
        self.digest.is_some()
    }

    /// The tag for tagged references, the manifest digest for digested ones.
    pub fn short_tag(&self) -> &str {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest,
            (None, Some(tag)) => tag,
            (None, None) => "",
        }
    }

    /// The same repository pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.repo();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = MirrorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Check that `digest` is `sha256:<64 lowercase hex>`.
pub fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| format!("unsupported digest '{}': expected sha256:hex", digest))?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
        return Err(format!("malformed sha256 digest '{}'", digest));
    }
    Ok(())
}

/// Split a name into registry and repository components.
///
/// The first component is a registry when it contains a dot or a colon, or
/// is `localhost`.
fn split_registry_repository(name: &str) -> Option<(String, String)> {
    let (first, rest) = name.split_once('/')?;
    if !(first.contains('.') || first.contains(':') || first == "localhost") {
        return None;
    }
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        return None;
    }
    Some((first.to_string(), rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_tagged() {
        let r = ImageReference::parse("registry.example.com/deckhouse/ee/install:v1.56.5").unwrap();
        assert_eq!(r.registry, "registry.example.com");
        assert_eq!(r.repository, "deckhouse/ee/install");
        assert_eq!(r.tag, Some("v1.56.5".to_string()));
        assert_eq!(r.digest, None);
        assert_eq!(r.short_tag(), "v1.56.5");
    }

    #[test]
    fn test_parse_digested() {
        let r = ImageReference::parse(&format!("registry.example.com/deckhouse/ee@{DIGEST}")).unwrap();
        assert_eq!(r.repository, "deckhouse/ee");
        assert_eq!(r.tag, None);
        assert!(r.is_digested());
        assert_eq!(r.short_tag(), DIGEST);
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/image:v1@{DIGEST}")).unwrap();
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, Some(DIGEST.to_string()));
        assert_eq!(r.short_tag(), DIGEST);
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("myregistry.io:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, "myregistry.io:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "myimage");
    }

    #[test]
    fn test_parse_requires_registry_host() {
        assert!(ImageReference::parse("library/nginx:1.25").is_err());
        assert!(ImageReference::parse("nginx:1.25").is_err());
    }

    #[test]
    fn test_parse_requires_tag_or_digest() {
        assert!(ImageReference::parse("ghcr.io/org/image").is_err());
        assert!(ImageReference::parse("ghcr.io/org/image:").is_err());
    }

    #[test]
    fn test_parse_empty_reference() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
    }

    #[test]
    fn test_parse_invalid_digest() {
        assert!(ImageReference::parse("ghcr.io/org/image@invaliddigest").is_err());
        assert!(ImageReference::parse("ghcr.io/org/image@sha256:abc").is_err());
        assert!(ImageReference::parse("ghcr.io/org/image@sha512:abc").is_err());
    }

    #[test]
    fn test_display_reproduces_input() {
        for input in [
            "registry.example.com/deckhouse/ee:alpha".to_string(),
            format!("registry.example.com/deckhouse/ee@{DIGEST}"),
            "localhost:5000/a/b/c/release:v1.2.3".to_string(),
        ] {
            assert_eq!(ImageReference::parse(&input).unwrap().to_string(), input);
        }
    }

    #[test]
    fn test_tagged_and_digested_helpers() {
        let r = ImageReference::tagged("registry.example.com/d8/", "stable").unwrap();
        assert_eq!(r.to_string(), "registry.example.com/d8:stable");
        let d = r.with_digest(DIGEST);
        assert_eq!(d.to_string(), format!("registry.example.com/d8@{DIGEST}"));
        assert_eq!(
            ImageReference::digested("registry.example.com/d8", DIGEST).unwrap(),
            d
        );
    }

    #[test]
    fn test_validate_digest() {
        assert!(validate_digest(DIGEST).is_ok());
        assert!(validate_digest(&DIGEST.to_uppercase()).is_err());
    }
}
