//! Version selection.
//!
//! Reads the five release channel heads and the release-channel tag listing
//! and decides which distribution versions to mirror.

use std::collections::{BTreeMap, BTreeSet};

use d8_mirror_core::config::RetryConfig;
use d8_mirror_core::error::{MirrorError, Result, ResultExt};
use tokio_util::sync::CancellationToken;

use crate::image::find_file_in_layers;
use crate::reference::ImageReference;
use crate::registry::{fetch_image, Registry};
use crate::release::{parse_version, ReleaseInfo, CHANGELOG_FILE, VERSION_FILE};
use crate::retry::retry_with_backoff;

/// Release channels, most to least adventurous.
pub const CHANNELS: [&str; 5] = ["alpha", "beta", "early-access", "stable", "rock-solid"];

/// The release each channel currently points to.
#[derive(Debug, Clone)]
pub struct ChannelHeads {
    heads: Vec<(String, ReleaseInfo)>,
}

impl ChannelHeads {
    pub fn new(heads: Vec<(String, ReleaseInfo)>) -> Self {
        Self { heads }
    }

    pub fn get(&self, channel: &str) -> Option<&ReleaseInfo> {
        self.heads
            .iter()
            .find(|(name, _)| name == channel)
            .map(|(_, info)| info)
    }

    /// Versions published by all channels.
    pub fn versions(&self) -> BTreeSet<semver::Version> {
        self.heads.iter().map(|(_, info)| info.version.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ReleaseInfo)> {
        self.heads.iter().map(|(name, info)| (name.as_str(), info))
    }
}

/// Computes the set of distribution versions to mirror.
pub struct VersionResolver<'a> {
    registry: &'a dyn Registry,
    repo: String,
    min_version: Option<semver::Version>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl<'a> VersionResolver<'a> {
    pub fn new(registry: &'a dyn Registry, repo: &str, min_version: Option<semver::Version>) -> Self {
        Self {
            registry,
            repo: repo.trim_matches('/').to_string(),
            min_version,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Retry policy and cancellation for channel reads.
    pub fn with_retry(mut self, retry: RetryConfig, cancel: CancellationToken) -> Self {
        self.retry = retry;
        self.cancel = cancel;
        self
    }

    /// Read every channel head, sequentially and in channel order.
    ///
    /// A suspended channel fails the whole read.
    pub async fn channel_heads(&self) -> Result<ChannelHeads> {
        let mut heads = Vec::with_capacity(CHANNELS.len());
        for channel in CHANNELS {
            let reference = ImageReference::tagged(&format!("{}/release-channel", self.repo), channel)?;
            let info = read_release_info(self.registry, &reference, &self.retry, &self.cancel)
                .await
                .with_context(|| format!("read {} channel", channel))?;
            if info.suspended {
                return Err(MirrorError::CorruptReleaseChannel {
                    image: reference.to_string(),
                    reason: format!("channel {} is suspended", channel),
                });
            }
            tracing::debug!(channel, version = %info.version, "Read channel head");
            heads.push((channel.to_string(), info));
        }
        Ok(ChannelHeads::new(heads))
    }

    /// Versions found among release-channel tags; other tags are dropped.
    pub async fn release_tags(&self) -> Result<Vec<semver::Version>> {
        let repository = format!("{}/release-channel", self.repo);
        let tags = retry_with_backoff(&self.retry, &self.cancel, &repository, || {
            self.registry.list_tags(&repository)
        })
        .await
        .with_context(|| format!("list tags of {}", repository))?;
        Ok(tags.iter().filter_map(|tag| parse_version(tag)).collect())
    }

    /// Channel heads plus the latest patch of each minor between the floor
    /// and the alpha version.
    pub async fn resolve(&self) -> Result<BTreeSet<semver::Version>> {
        let heads = self.channel_heads().await?;
        self.resolve_with_heads(&heads).await
    }

    /// [`VersionResolver::resolve`] for already-read channel heads.
    pub async fn resolve_with_heads(&self, heads: &ChannelHeads) -> Result<BTreeSet<semver::Version>> {
        let (alpha, rock_solid) = match (heads.get("alpha"), heads.get("rock-solid")) {
            (Some(alpha), Some(rock_solid)) => (&alpha.version, &rock_solid.version),
            _ => {
                return Err(MirrorError::CorruptReleaseChannel {
                    image: format!("{}/release-channel", self.repo),
                    reason: "alpha and rock-solid channels are required".to_string(),
                })
            }
        };
        let floor = self.min_version.clone().unwrap_or_else(|| rock_solid.clone());
        let tags = self.release_tags().await?;
        let versions = select_versions(&heads.versions(), &tags, &floor, alpha);
        tracing::info!(
            floor = %floor,
            ceiling = %alpha,
            count = versions.len(),
            "Resolved versions to mirror"
        );
        Ok(versions)
    }
}

/// Keep tags in `[floor, ceiling]`, reduce to the latest patch of each
/// `(major, minor)` and add the channel heads.
pub fn select_versions(
    heads: &BTreeSet<semver::Version>,
    tags: &[semver::Version],
    floor: &semver::Version,
    ceiling: &semver::Version,
) -> BTreeSet<semver::Version> {
    let mut latest: BTreeMap<(u64, u64), &semver::Version> = BTreeMap::new();
    for version in tags.iter().filter(|v| *v >= floor && *v <= ceiling) {
        latest
            .entry((version.major, version.minor))
            .and_modify(|current| {
                if version > *current {
                    *current = version;
                }
            })
            .or_insert(version);
    }
    latest
        .into_values()
        .cloned()
        .chain(heads.iter().cloned())
        .collect()
}

/// Pull a release-channel image and parse its metadata.
pub async fn read_release_info(
    registry: &dyn Registry,
    reference: &ImageReference,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<ReleaseInfo> {
    let key = reference.to_string();
    let (_manifest, blobs) = retry_with_backoff(retry, cancel, &key, || fetch_image(registry, reference)).await?;
    // Config comes first; only layers carry files.
    let layers: Vec<&[u8]> = blobs.iter().skip(1).map(|b| b.data.as_slice()).collect();
    let version_json = find_file_in_layers(layers.iter().copied(), VERSION_FILE)?.ok_or_else(|| {
        MirrorError::CorruptReleaseChannel {
            image: reference.to_string(),
            reason: format!("missing {}", VERSION_FILE),
        }
    })?;
    let changelog = find_file_in_layers(layers.iter().copied(), CHANGELOG_FILE)?;
    ReleaseInfo::parse(&reference.to_string(), &version_json, changelog.as_deref())
}
