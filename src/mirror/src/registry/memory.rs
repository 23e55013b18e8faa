//! In-process registry.
//!
//! Holds repositories, tags, manifests and blobs in memory. Counts HEAD
//! requests and can inject transient failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use d8_mirror_core::error::{MirrorError, Result};
use parking_lot::RwLock;

use super::{verify_digest, Blob, BlobDescriptor, RawManifest, Registry};
use crate::image::{build_image, BuiltImage};
use crate::reference::ImageReference;

#[derive(Default)]
struct Repository {
    tags: BTreeMap<String, String>,
    manifests: HashMap<String, RawManifest>,
    blobs: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    repositories: BTreeMap<String, Repository>,
    blobs: HashMap<String, Vec<u8>>,
    failures: HashMap<String, usize>,
}

/// [`Registry`] kept entirely in memory.
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<State>,
    head_requests: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a single-layer image holding `files` and tag it.
    pub fn put_image(&self, repository: &str, tag: &str, files: &[(&str, &[u8])]) -> Result<String> {
        let image = build_image(files)?;
        self.put_built(repository, Some(tag), &image);
        Ok(image.manifest.digest)
    }

    /// Store a prepared image, optionally tagging it.
    pub fn put_built(&self, repository: &str, tag: Option<&str>, image: &BuiltImage) {
        let mut state = self.state.write();
        for blob in image.blobs() {
            state
                .blobs
                .insert(blob.descriptor.digest.clone(), blob.data.clone());
        }
        let repo = state.repositories.entry(repository.to_string()).or_default();
        for blob in image.blobs() {
            repo.blobs.insert(blob.descriptor.digest.clone());
        }
        repo.manifests
            .insert(image.manifest.digest.clone(), image.manifest.clone());
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), image.manifest.digest.clone());
        }
    }

    /// Store a raw manifest (e.g. an image index) without blob checks.
    pub fn put_manifest(&self, repository: &str, tag: Option<&str>, manifest: RawManifest) {
        let mut state = self.state.write();
        let repo = state.repositories.entry(repository.to_string()).or_default();
        if let Some(tag) = tag {
            repo.tags.insert(tag.to_string(), manifest.digest.clone());
        }
        repo.manifests.insert(manifest.digest.clone(), manifest);
    }

    /// Point `tag` at an existing manifest.
    pub fn tag(&self, repository: &str, tag: &str, digest: &str) {
        let mut state = self.state.write();
        let repo = state.repositories.entry(repository.to_string()).or_default();
        repo.tags.insert(tag.to_string(), digest.to_string());
    }

    /// Make the next `count` manifest fetches of `reference` fail transiently.
    pub fn fail_next(&self, reference: &str, count: usize) {
        self.state
            .write()
            .failures
            .insert(reference.to_string(), count);
    }

    pub fn head_requests(&self) -> usize {
        self.head_requests.load(Ordering::SeqCst)
    }

    /// Every blob digest stored in the registry.
    pub fn blob_digests(&self) -> BTreeSet<String> {
        self.state.read().blobs.keys().cloned().collect()
    }

    /// Tags of a repository, empty when it does not exist.
    pub fn tags(&self, repository: &str) -> Vec<String> {
        self.state
            .read()
            .repositories
            .get(repository)
            .map(|repo| repo.tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Repository names, sorted.
    pub fn repositories(&self) -> Vec<String> {
        self.state.read().repositories.keys().cloned().collect()
    }

    fn resolve(state: &State, reference: &ImageReference) -> Result<String> {
        let repo = state
            .repositories
            .get(&reference.repo())
            .ok_or_else(|| MirrorError::ImageNotFound(reference.to_string()))?;
        let digest = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => digest.clone(),
            (None, Some(tag)) => repo
                .tags
                .get(tag)
                .cloned()
                .ok_or_else(|| MirrorError::ImageNotFound(reference.to_string()))?,
            (None, None) => return Err(MirrorError::ImageNotFound(reference.to_string())),
        };
        if !repo.manifests.contains_key(&digest) {
            return Err(MirrorError::ImageNotFound(reference.to_string()));
        }
        Ok(digest)
    }

    fn take_failure(&self, reference: &ImageReference) -> Result<()> {
        let mut state = self.state.write();
        let key = reference.to_string();
        if let Some(remaining) = state.failures.get_mut(&key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MirrorError::RegistryUnavailable {
                    reference: key,
                    message: "injected failure".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn head_manifest(&self, reference: &ImageReference) -> Result<String> {
        self.head_requests.fetch_add(1, Ordering::SeqCst);
        Self::resolve(&self.state.read(), reference)
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        state
            .repositories
            .get(repository)
            .map(|repo| repo.tags.keys().cloned().collect())
            .ok_or_else(|| MirrorError::ImageNotFound(repository.to_string()))
    }

    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        self.take_failure(reference)?;
        let state = self.state.read();
        let digest = Self::resolve(&state, reference)?;
        state
            .repositories
            .get(&reference.repo())
            .and_then(|repo| repo.manifests.get(&digest))
            .cloned()
            .ok_or_else(|| MirrorError::ImageNotFound(reference.to_string()))
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &BlobDescriptor,
    ) -> Result<Vec<u8>> {
        let state = self.state.read();
        let linked = state
            .repositories
            .get(&reference.repo())
            .map_or(false, |repo| repo.blobs.contains(&descriptor.digest));
        match state.blobs.get(&descriptor.digest) {
            Some(data) if linked => Ok(data.clone()),
            _ => Err(MirrorError::ImageNotFound(format!(
                "{}@{}",
                reference.repo(),
                descriptor.digest
            ))),
        }
    }

    async fn push_blob(&self, reference: &ImageReference, blob: &Blob) -> Result<()> {
        verify_digest(&blob.descriptor.digest, &blob.data)?;
        let mut state = self.state.write();
        state
            .blobs
            .entry(blob.descriptor.digest.clone())
            .or_insert_with(|| blob.data.clone());
        state
            .repositories
            .entry(reference.repo())
            .or_default()
            .blobs
            .insert(blob.descriptor.digest.clone());
        Ok(())
    }

    async fn push_manifest(&self, reference: &ImageReference, manifest: &RawManifest) -> Result<()> {
        if let Some(digest) = &reference.digest {
            if digest != &manifest.digest {
                return Err(MirrorError::Other(format!(
                    "manifest digest {} does not match reference {}",
                    manifest.digest, reference
                )));
            }
        }

        let mut state = self.state.write();
        let repo = state.repositories.entry(reference.repo()).or_default();
        if !manifest.is_index() {
            let (config, layers) = manifest.blobs()?;
            if let Some(missing) = std::iter::once(&config)
                .chain(layers.iter())
                .find(|d| !repo.blobs.contains(&d.digest))
            {
                return Err(MirrorError::Other(format!(
                    "{}: blob {} not uploaded",
                    reference, missing.digest
                )));
            }
        }
        repo.manifests
            .insert(manifest.digest.clone(), manifest.clone());
        if reference.digest.is_none() {
            if let Some(tag) = &reference.tag {
                repo.tags.insert(tag.clone(), manifest.digest.clone());
            }
        }
        tracing::debug!(reference = %reference, digest = %manifest.digest, "Stored manifest");
        Ok(())
    }
}
