//! Layout set pusher.
//!
//! Re-publishes every layout of a [`LayoutSet`] under a destination
//! repository, keeping the source path suffixes and short tags.

use std::sync::Arc;

use d8_mirror_core::config::RetryConfig;
use d8_mirror_core::error::{MirrorError, Result, ResultExt};
use d8_mirror_core::event::{events, EventEmitter, MirrorEvent};
use tokio_util::sync::CancellationToken;

use crate::image::build_image;
use crate::layout::{Family, ImageLayout, IndexEntry, LayoutSet};
use crate::reference::ImageReference;
use crate::registry::{Blob, RawManifest, Registry};
use crate::retry::retry_with_backoff;

/// Counts reported by a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushSummary {
    /// Images pushed from layouts
    pub images: usize,
    /// Synthetic module tags written
    pub module_tags: usize,
}

/// Pushes layouts into one destination repository.
pub struct Pusher {
    registry: Arc<dyn Registry>,
    destination: String,
    retry: RetryConfig,
    events: EventEmitter,
    cancel: CancellationToken,
}

impl Pusher {
    pub fn new(
        registry: Arc<dyn Registry>,
        destination: &str,
        retry: RetryConfig,
        events: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            destination: destination.trim_matches('/').to_string(),
            retry,
            events,
            cancel,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Push every layout of `set`, then anchor each module with a tag.
    ///
    /// The first failing image aborts the push; images already pushed stay.
    pub async fn push_set(&self, set: &LayoutSet) -> Result<PushSummary> {
        let mut summary = PushSummary::default();
        for (family, layout) in set.layouts() {
            let repo = format!("{}{}", self.destination, set.suffix(&family));
            summary.images += self
                .push_layout(layout, &repo)
                .await
                .with_context(|| format!("push {}", family))?;
        }
        summary.module_tags = self.push_module_tags(set).await?;
        Ok(summary)
    }

    /// Push each image of `layout` to `repo` under its short tag.
    pub async fn push_layout(&self, layout: &ImageLayout, repo: &str) -> Result<usize> {
        let mut pushed = 0;
        for entry in layout.entries() {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            let target = destination_reference(repo, entry)?;
            let (manifest, blobs) = layout.read_image(entry)?;
            self.push_image(&target, &manifest, &blobs)
                .await
                .with_context(|| format!("push {}", target))?;
            pushed += 1;
        }
        tracing::info!(layout = %layout.path().display(), repository = %repo, images = pushed, "Pushed layout");
        Ok(pushed)
    }

    /// Tag `<modules repo>:<module>` with a one-layer image per module.
    pub async fn push_module_tags(&self, set: &LayoutSet) -> Result<usize> {
        let repo = format!("{}{}", self.destination, set.modules_suffix());
        let mut count = 0;
        for name in set.module_names() {
            let image = build_image(&[("module", name.as_bytes())])?;
            let target = ImageReference::tagged(&repo, name)?;
            let blobs: Vec<Blob> = image.blobs().cloned().collect();
            self.push_image(&target, &image.manifest, &blobs)
                .await
                .with_context(|| format!("push module tag {}", target))?;
            count += 1;
        }
        Ok(count)
    }

    async fn push_image(
        &self,
        target: &ImageReference,
        manifest: &RawManifest,
        blobs: &[Blob],
    ) -> Result<()> {
        let key = target.to_string();
        for blob in blobs {
            retry_with_backoff(&self.retry, &self.cancel, &blob.descriptor.digest, || {
                self.registry.push_blob(target, blob)
            })
            .await?;
        }
        retry_with_backoff(&self.retry, &self.cancel, &key, || {
            self.registry.push_manifest(target, manifest)
        })
        .await?;

        tracing::debug!(reference = %key, digest = %manifest.digest, "Pushed image");
        self.events.emit(MirrorEvent::with_fields(
            events::IMAGE_PUSHED,
            [
                ("reference", serde_json::json!(key)),
                ("digest", serde_json::json!(manifest.digest)),
            ],
        ));
        Ok(())
    }
}

/// `<repo>:<short tag>`, or `<repo>@<digest>` when the short tag is a digest.
fn destination_reference(repo: &str, entry: &IndexEntry) -> Result<ImageReference> {
    let short_tag = entry.short_tag().ok_or_else(|| {
        MirrorError::LayoutInvalid(vec![format!(
            "manifest {} has no short tag annotation",
            entry.digest
        )])
    })?;
    if short_tag.contains(':') {
        ImageReference::digested(repo, short_tag)
    } else {
        ImageReference::tagged(repo, short_tag)
    }
}
