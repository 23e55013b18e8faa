//! Tag to digest resolution.

use std::collections::HashMap;
use std::sync::Arc;

use d8_mirror_core::error::Result;
use parking_lot::RwLock;

use crate::reference::ImageReference;
use crate::registry::Registry;

/// Resolves tagged references to manifest digests and memoizes the answer.
///
/// One resolver lives for one operation; it is shared by every pull worker.
#[derive(Clone)]
pub struct TagResolver {
    registry: Arc<dyn Registry>,
    cache: Arc<RwLock<HashMap<String, String>>>,
}

impl TagResolver {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Digest of `reference`.
    ///
    /// Digested references are answered without a network call.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<String> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.clone());
        }

        let key = reference.to_string();
        if let Some(digest) = self.cache.read().get(&key) {
            return Ok(digest.clone());
        }

        let digest = self.registry.head_manifest(reference).await?;
        tracing::debug!(reference = %key, digest = %digest, "Resolved tag");

        // A concurrent resolution may have won; keep its answer.
        let mut cache = self.cache.write();
        Ok(cache.entry(key).or_insert(digest).clone())
    }

    /// Digest of `reference`, or `None` when the registry has no such tag.
    pub async fn resolve_optional(&self, reference: &ImageReference) -> Result<Option<String>> {
        match self.resolve(reference).await {
            Ok(digest) => Ok(Some(digest)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Number of cached tags.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}
