//! Top-level mirror pipelines.
//!
//! Each pipeline is a sequence of [`Step`]s over one [`MirrorOperation`].
//! Steps serialize; work inside a step may run concurrently across layouts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use d8_mirror_core::config::MirrorContext;
use d8_mirror_core::error::{MirrorError, Result, ResultExt};
use d8_mirror_core::event::EventEmitter;
use d8_mirror_core::filter::ModuleFilter;
use d8_mirror_core::log::Step;
use tokio_util::sync::CancellationToken;

use crate::bundle::{list_chunks, BundlePacker, BundleUnpacker, PackOptions, PackSummary, UnpackSummary};
use crate::image_set::{ImageSetBuilder, ImageSets, Module};
use crate::layout::{Family, LayoutSet};
use crate::manifests::ReleaseManifestGenerator;
use crate::modules::{discover_modules, ModuleSourceDescriptor};
use crate::pull::{PullSummary, Puller};
use crate::push::{PushSummary, Pusher};
use crate::registry::{OciRegistry, Registry, TransportOptions};
use crate::tags::TagResolver;
use crate::validate::Validator;
use crate::versions::VersionResolver;

/// Everything one mirror run needs.
///
/// Built at the start of a run and dropped at its end; the tag cache inside
/// [`TagResolver`] lives exactly as long.
#[derive(Clone)]
pub struct MirrorOperation {
    pub ctx: Arc<MirrorContext>,
    pub source: Arc<dyn Registry>,
    pub destination: Option<Arc<dyn Registry>>,
    pub resolver: TagResolver,
    pub events: EventEmitter,
    pub cancel: CancellationToken,
}

impl MirrorOperation {
    pub fn new(ctx: MirrorContext, source: Arc<dyn Registry>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            resolver: TagResolver::new(source.clone()),
            source,
            destination: None,
            events: EventEmitter::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Operation over real registries built from the context.
    ///
    /// The same transport settings and credentials serve both sides.
    pub fn connect(ctx: MirrorContext) -> Result<Self> {
        ctx.validate()?;
        let options = TransportOptions::from_context(&ctx);
        let source: Arc<dyn Registry> = Arc::new(OciRegistry::new(&options));
        let destination: Option<Arc<dyn Registry>> = ctx
            .destination_repo()
            .map(|_| Arc::new(OciRegistry::new(&options)) as Arc<dyn Registry>);
        let mut op = Self::new(ctx, source);
        op.destination = destination;
        Ok(op)
    }

    /// Operation reading modules from a module source descriptor.
    pub fn connect_module_source(ctx: MirrorContext, descriptor: &ModuleSourceDescriptor) -> Result<Self> {
        let mut options = TransportOptions::from_context(&ctx);
        options.auth = descriptor.auth()?;
        let source: Arc<dyn Registry> = Arc::new(OciRegistry::new(&options));
        Ok(Self::new(ctx, source))
    }

    pub fn with_destination(mut self, destination: Arc<dyn Registry>) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn puller(&self) -> Puller {
        Puller::new(
            self.source.clone(),
            self.resolver.clone(),
            self.ctx.retry.clone(),
            self.events.clone(),
            self.cancel.clone(),
        )
    }

    fn validator(&self) -> Validator {
        Validator::new(self.ctx.validation_mode, self.events.clone())
    }

    fn destination(&self) -> Result<(Arc<dyn Registry>, String)> {
        let repo = self.ctx.destination_repo().ok_or_else(|| {
            MirrorError::Config("registryHost must be set to push".to_string())
        })?;
        let registry = self.destination.clone().ok_or_else(|| {
            MirrorError::Config("no destination registry configured".to_string())
        })?;
        Ok((registry, repo))
    }
}

/// Outcome of a pull pipeline.
#[derive(Debug, Clone, Default)]
pub struct PullReport {
    /// Distribution versions mirrored (empty for module sources)
    pub versions: BTreeSet<semver::Version>,
    pub modules: Vec<String>,
    pub images: PullSummary,
    pub bundle: Option<PackSummary>,
}

/// Outcome of a push pipeline.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    pub unpacked: Option<UnpackSummary>,
    pub images: PushSummary,
    pub release_manifests: Option<PathBuf>,
}

/// Mirror a distribution into `WorkDir` and pack it when a bundle path is set.
///
/// `versions` of `None` resolves what to mirror from the channel graph. The
/// channels are read first either way, so a suspended channel stops the run
/// before anything is written.
pub async fn pull_to_local_fs(
    op: &MirrorOperation,
    versions: Option<&[semver::Version]>,
) -> Result<PullReport> {
    let ctx = op.ctx.as_ref();
    let repo = ctx.source_repo().to_string();
    let resolver = VersionResolver::new(op.source.as_ref(), &repo, ctx.min_version.clone())
        .with_retry(ctx.retry.clone(), op.cancel.clone());

    let step = Step::start("Resolve versions", &op.events);
    let versions = step.finish(
        async {
            let heads = resolver.channel_heads().await?;
            match versions {
                Some(versions) => Ok(versions.iter().cloned().collect::<BTreeSet<_>>()),
                None => resolver.resolve_with_heads(&heads).await,
            }
        }
        .await,
    )?;

    let mut set = LayoutSet::create(&ctx.work_dir, &repo).context("create layouts")?;
    let builder = ImageSetBuilder::new(&repo);
    let mut sets = ImageSets::default();
    let puller = op.puller();
    let mut images = PullSummary::default();

    let step = Step::start("Pull release channels and installers", &op.events);
    images += step.finish(
        async {
            builder.seed_channels(&mut sets)?;
            builder.expand_versions(&mut sets, &versions)?;
            pull_families(&puller, &mut set, &mut sets, ctx.concurrency, |family| {
                matches!(family, Family::Installers | Family::ReleaseChannels)
            })
            .await
        }
        .await,
    )?;

    let step = Step::start("Pull distribution images", &op.events);
    images += step.finish(
        async {
            let installers = set
                .get(&Family::Installers)
                .ok_or_else(|| MirrorError::Other("installers layout missing".to_string()))?;
            let added = builder.extract_installer_digests(&mut sets, installers)?;
            tracing::info!(digests = added, "Collected component digests");
            builder.seed_security_databases(&mut sets)?;
            let mut summary = pull_families(&puller, &mut set, &mut sets, ctx.concurrency, |family| {
                matches!(family, Family::Distribution | Family::SecurityDatabase(_))
            })
            .await?;

            let distribution = set
                .get(&Family::Distribution)
                .ok_or_else(|| MirrorError::Other("distribution layout missing".to_string()))?;
            let added = builder.extract_bundled_module_images(&mut sets, distribution)?;
            tracing::info!(images = added, "Collected bundled module images");
            summary += pull_families(&puller, &mut set, &mut sets, ctx.concurrency, |family| {
                *family == Family::Distribution
            })
            .await?;
            Ok(summary)
        }
        .await,
    )?;

    let step = Step::start("Pull modules", &op.events);
    let (modules, module_images) = step.finish(
        pull_modules(op, &puller, &builder, &mut set, &mut sets, &ctx.module_filter).await,
    )?;
    images += module_images;

    finish_pull(op, &set, versions, modules, images).await
}

/// Mirror only the add-on modules of a module source into
/// `WorkDir/<registry>`.
pub async fn pull_module_sources(
    op: &MirrorOperation,
    descriptor: &ModuleSourceDescriptor,
) -> Result<PullReport> {
    let registry = descriptor.registry().to_string();
    let filter = descriptor.filter();
    let builder = ImageSetBuilder::for_module_source(&registry);
    let mut set =
        LayoutSet::create_modules_only(&op.ctx.work_dir, &registry).context("create layouts")?;
    let mut sets = ImageSets::default();
    let puller = op.puller();

    let step = Step::start("Pull module sources", &op.events);
    let (modules, images) =
        step.finish(pull_modules(op, &puller, &builder, &mut set, &mut sets, &filter).await)?;

    finish_pull(op, &set, BTreeSet::new(), modules, images).await
}

/// Unpack (when a bundle is present), validate and push a distribution.
pub async fn push_from_local_fs(op: &MirrorOperation) -> Result<PushReport> {
    let ctx = op.ctx.as_ref();
    let (registry, destination) = op.destination()?;
    let unpacked = unpack_if_present(op).await?;

    let set = LayoutSet::open(&ctx.work_dir, ctx.source_repo()).context("open layouts")?;
    validate(op, &set)?;

    let pusher = Pusher::new(
        registry,
        &destination,
        ctx.retry.clone(),
        op.events.clone(),
        op.cancel.clone(),
    );
    let step = Step::start("Push layouts", &op.events);
    let images = step.finish(pusher.push_set(&set).await)?;

    let release_manifests = match &ctx.release_manifests_path {
        Some(path) => {
            let step = Step::start("Write release manifests", &op.events);
            step.finish(write_release_manifests(&set, path))?;
            Some(path.clone())
        }
        None => None,
    };

    Ok(PushReport {
        unpacked,
        images,
        release_manifests,
    })
}

/// Push module layouts previously pulled from the module source `registry`.
pub async fn push_module_sources(op: &MirrorOperation, registry: &str) -> Result<PushReport> {
    let (destination_registry, destination) = op.destination()?;
    let unpacked = unpack_if_present(op).await?;

    let set = LayoutSet::open_modules_only(&op.ctx.work_dir, registry).context("open layouts")?;
    validate(op, &set)?;

    let pusher = Pusher::new(
        destination_registry,
        &destination,
        op.ctx.retry.clone(),
        op.events.clone(),
        op.cancel.clone(),
    );
    let step = Step::start("Push module sources", &op.events);
    let images = step.finish(pusher.push_set(&set).await)?;
    Ok(PushReport {
        unpacked,
        images,
        release_manifests: None,
    })
}

/// Module phases: discover, pull releases, expand versions, pull module
/// images, then pull their component digests.
///
/// The expansion adds `release:vX` references alongside module images, so
/// both families are pulled after it. Each pass only takes references not
/// handed out before.
async fn pull_modules(
    op: &MirrorOperation,
    puller: &Puller,
    builder: &ImageSetBuilder,
    set: &mut LayoutSet,
    sets: &mut ImageSets,
    filter: &ModuleFilter,
) -> Result<(Vec<String>, PullSummary)> {
    let concurrency = op.ctx.concurrency;
    let modules: Vec<Module> = discover_modules(op.source.as_ref(), builder.modules_repo(), filter).await?;
    for module in &modules {
        set.add_module(&module.name)?;
        builder.seed_module(sets, module, filter)?;
    }

    let mut images = pull_families(puller, set, sets, concurrency, |family| {
        matches!(family, Family::ModuleReleases(_))
    })
    .await?;

    for module in &modules {
        let releases = set
            .get(&Family::ModuleReleases(module.name.clone()))
            .ok_or_else(|| MirrorError::Other(format!("release layout of {} missing", module.name)))?;
        let tags = builder.expand_module_versions(sets, &module.name, releases)?;
        tracing::debug!(module = %module.name, releases = ?tags, "Module releases");
    }
    images += pull_families(puller, set, sets, concurrency, |family| {
        matches!(family, Family::ModuleReleases(_) | Family::Module(_))
    })
    .await?;

    for module in &modules {
        let layout = set
            .get(&Family::Module(module.name.clone()))
            .ok_or_else(|| MirrorError::Other(format!("layout of {} missing", module.name)))?;
        builder.extract_module_digests(sets, &module.name, layout)?;
    }
    images += pull_families(puller, set, sets, concurrency, |family| {
        matches!(family, Family::Module(_))
    })
    .await?;

    Ok((modules.into_iter().map(|m| m.name).collect(), images))
}

/// Pull the sets of every family `pick` accepts.
async fn pull_families<F>(
    puller: &Puller,
    set: &mut LayoutSet,
    sets: &mut ImageSets,
    concurrency: usize,
    pick: F,
) -> Result<PullSummary>
where
    F: Fn(&Family) -> bool,
{
    let pending = sets.take_pending(&pick);
    let jobs = set
        .layouts_mut()
        .into_iter()
        .filter(|(family, _)| pick(family))
        .filter_map(|(family, layout)| {
            let images = pending.get(&family)?;
            Some((family, layout, images))
        })
        .collect();
    puller.pull_many(jobs, concurrency).await
}

async fn finish_pull(
    op: &MirrorOperation,
    set: &LayoutSet,
    versions: BTreeSet<semver::Version>,
    modules: Vec<String>,
    images: PullSummary,
) -> Result<PullReport> {
    validate(op, set)?;
    let bundle = match &op.ctx.bundle_path {
        Some(path) => Some(pack(op, path).await?),
        None => None,
    };
    Ok(PullReport {
        versions,
        modules,
        images,
        bundle,
    })
}

fn validate(op: &MirrorOperation, set: &LayoutSet) -> Result<()> {
    let step = Step::start("Validate layouts", &op.events);
    let validator = op.validator();
    step.finish(validator.ensure_valid(set.layouts().into_iter().map(|(_, layout)| layout)))
}

async fn pack(op: &MirrorOperation, bundle: &Path) -> Result<PackSummary> {
    let step = Step::start("Pack bundle", &op.events);
    let packer = BundlePacker::new(
        PackOptions::from_context(&op.ctx),
        op.events.clone(),
        op.cancel.clone(),
    );
    let work_dir = op.ctx.work_dir.clone();
    let bundle = bundle.to_path_buf();
    let result = tokio::task::spawn_blocking(move || packer.pack(&work_dir, &bundle))
        .await
        .map_err(|e| MirrorError::Other(format!("pack task failed: {}", e)))
        .and_then(|result| result);
    step.finish(result)
}

async fn unpack_if_present(op: &MirrorOperation) -> Result<Option<UnpackSummary>> {
    let Some(bundle) = op.ctx.bundle_path.clone() else {
        return Ok(None);
    };
    if list_chunks(&bundle)?.is_empty() {
        tracing::info!(bundle = %bundle.display(), "No bundle chunks, using work dir as is");
        return Ok(None);
    }

    let step = Step::start("Unpack bundle", &op.events);
    let unpacker = BundleUnpacker::new(op.events.clone(), op.cancel.clone());
    let work_dir = op.ctx.work_dir.clone();
    let result = tokio::task::spawn_blocking(move || unpacker.unpack(&bundle, &work_dir))
        .await
        .map_err(|e| MirrorError::Other(format!("unpack task failed: {}", e)))
        .and_then(|result| result);
    step.finish(result).map(Some)
}

fn write_release_manifests(set: &LayoutSet, path: &Path) -> Result<()> {
    let layout = set
        .get(&Family::ReleaseChannels)
        .ok_or_else(|| MirrorError::Other("release-channel layout missing".to_string()))?;
    let generator = ReleaseManifestGenerator::new(layout);
    let versions = generator.layout_versions();
    generator.write(path, &versions)
}
