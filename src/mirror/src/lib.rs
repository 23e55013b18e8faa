//! Deckhouse Mirror - air-gapped registry mirror engine.
//!
//! Walks the image closure of a distribution (release channels, versions,
//! installers, component digests, add-on modules), materializes it as OCI
//! image layouts, ships it as a chunked bundle and re-publishes it into a
//! destination registry with digests and tags intact.

#![allow(clippy::result_large_err)]

pub mod bundle;
pub mod image;
pub mod image_set;
pub mod layout;
pub mod manifests;
pub mod modules;
pub mod ops;
pub mod pull;
pub mod push;
pub mod reference;
pub mod registry;
pub mod release;
pub mod retry;
pub mod tags;
pub mod validate;
pub mod versions;

// Re-export common types
pub use bundle::{BundlePacker, BundleUnpacker, ChunkInfo, PackOptions, PackSummary, UnpackSummary};
pub use image_set::{ImageSet, ImageSetBuilder, ImageSets, Module, Requirement};
pub use layout::{Family, ImageLayout, LayoutSet};
pub use manifests::ReleaseManifestGenerator;
pub use modules::{discover_modules, ModuleSourceDescriptor};
pub use ops::{
    pull_module_sources, pull_to_local_fs, push_from_local_fs, push_module_sources,
    MirrorOperation, PullReport, PushReport,
};
pub use pull::{PullSummary, Puller};
pub use push::{PushSummary, Pusher};
pub use reference::ImageReference;
pub use registry::{OciRegistry, Registry, TransportOptions};
#[cfg(any(test, feature = "test-utils"))]
pub use registry::MemoryRegistry;
pub use release::ReleaseInfo;
pub use tags::TagResolver;
pub use validate::{LayoutProblem, Validator};
pub use versions::{ChannelHeads, VersionResolver, CHANNELS};

pub use d8_mirror_core::{MirrorContext, MirrorError, Result};

/// Deckhouse Mirror version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
