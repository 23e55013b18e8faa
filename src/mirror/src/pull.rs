//! Image set puller.
//!
//! Downloads the references of an [`ImageSet`] into a layout. Layouts are
//! pulled concurrently; appends within one layout are sequential.

use std::sync::Arc;

use d8_mirror_core::config::RetryConfig;
use d8_mirror_core::error::{MirrorError, Result, ResultExt};
use d8_mirror_core::event::{events, EventEmitter, MirrorEvent};
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::image_set::{ImageSet, Requirement};
use crate::layout::{pull_annotations, Family, ImageLayout, ANNOTATION_SOURCE_DIGEST};
use crate::reference::ImageReference;
use crate::registry::{fetch_platform_manifest, Registry};
use crate::retry::retry_with_backoff;
use crate::tags::TagResolver;

/// Counts reported by a pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Images appended to the layout
    pub pulled: usize,
    /// Images already present from an earlier run
    pub skipped: usize,
    /// Optional images absent from the registry
    pub missing: usize,
}

impl std::ops::AddAssign for PullSummary {
    fn add_assign(&mut self, other: PullSummary) {
        self.pulled += other.pulled;
        self.skipped += other.skipped;
        self.missing += other.missing;
    }
}

enum Outcome {
    Pulled,
    Skipped,
    Missing,
}

/// Pulls image sets from one source registry.
#[derive(Clone)]
pub struct Puller {
    registry: Arc<dyn Registry>,
    resolver: TagResolver,
    retry: RetryConfig,
    events: EventEmitter,
    cancel: CancellationToken,
}

impl Puller {
    pub fn new(
        registry: Arc<dyn Registry>,
        resolver: TagResolver,
        retry: RetryConfig,
        events: EventEmitter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            resolver,
            retry,
            events,
            cancel,
        }
    }

    /// Pull every reference of `set` into `layout`.
    pub async fn pull(&self, layout: &mut ImageLayout, set: &ImageSet) -> Result<PullSummary> {
        let mut summary = PullSummary::default();
        for (reference, requirement) in set.iter() {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            match self
                .pull_one(layout, reference, requirement)
                .await
                .with_context(|| format!("pull {}", reference))?
            {
                Outcome::Pulled => summary.pulled += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::Missing => summary.missing += 1,
            }
        }
        tracing::info!(
            layout = %layout.path().display(),
            pulled = summary.pulled,
            skipped = summary.skipped,
            missing = summary.missing,
            "Pulled image set"
        );
        Ok(summary)
    }

    /// Pull several layouts with at most `concurrency` in flight.
    ///
    /// The first failure aborts the remaining pulls.
    pub async fn pull_many<'a>(
        &self,
        jobs: Vec<(Family, &'a mut ImageLayout, &'a ImageSet)>,
        concurrency: usize,
    ) -> Result<PullSummary> {
        stream::iter(jobs)
            .map(|(family, layout, set)| async move {
                self.pull(layout, set)
                    .await
                    .with_context(|| format!("pull {}", family))
            })
            .buffer_unordered(concurrency.max(1))
            .try_fold(PullSummary::default(), |mut total, summary| async move {
                total += summary;
                Ok(total)
            })
            .await
    }

    async fn pull_one(
        &self,
        layout: &mut ImageLayout,
        reference: &ImageReference,
        requirement: Requirement,
    ) -> Result<Outcome> {
        let key = reference.to_string();
        let resolved = retry_with_backoff(&self.retry, &self.cancel, &key, || {
            self.resolver.resolve(reference)
        })
        .await;
        let digest = match resolved {
            Ok(digest) => digest,
            Err(e) if e.is_not_found() && requirement == Requirement::Optional => {
                tracing::warn!(reference = %key, "Optional image not found, skipping");
                return Ok(Outcome::Missing);
            }
            Err(e) => return Err(e),
        };

        if layout.contains(&key, &digest) {
            tracing::debug!(reference = %key, digest = %digest, "Image already in layout");
            self.events.emit(MirrorEvent::with_fields(
                events::IMAGE_SKIPPED,
                [("reference", serde_json::json!(key))],
            ));
            return Ok(Outcome::Skipped);
        }

        let pinned = reference.with_digest(&digest);
        let manifest = retry_with_backoff(&self.retry, &self.cancel, &key, || {
            fetch_platform_manifest(self.registry.as_ref(), &pinned)
        })
        .await?;

        let (config, layers) = manifest.blobs()?;
        for descriptor in std::iter::once(config).chain(layers) {
            if layout.has_blob(&descriptor.digest) {
                continue;
            }
            let data = retry_with_backoff(&self.retry, &self.cancel, &descriptor.digest, || {
                self.registry.fetch_blob(&pinned, &descriptor)
            })
            .await?;
            layout.write_blob(&descriptor.digest, &data)?;
        }

        let mut annotations = pull_annotations(reference, &manifest.digest);
        if manifest.digest != digest {
            annotations.insert(ANNOTATION_SOURCE_DIGEST.to_string(), digest.clone());
        }
        layout.append_image(&manifest, &[], annotations)?;

        tracing::debug!(reference = %key, digest = %manifest.digest, "Pulled image");
        self.events.emit(MirrorEvent::with_fields(
            events::IMAGE_PULLED,
            [
                ("reference", serde_json::json!(key)),
                ("digest", serde_json::json!(manifest.digest)),
                ("layout", serde_json::json!(layout.path().display().to_string())),
            ],
        ));
        Ok(Outcome::Pulled)
    }
}
