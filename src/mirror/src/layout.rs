//! OCI image layouts on disk.
//!
//! Each layout directory holds:
//! - `oci-layout`
//! - `index.json`
//! - `blobs/sha256/...`
//!
//! [`LayoutSet`] groups the layouts of one mirror operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use d8_mirror_core::error::{MirrorError, Result};
use oci_distribution::manifest::OCI_IMAGE_INDEX_MEDIA_TYPE;
use serde::{Deserialize, Serialize};

use crate::image::find_file_in_layers;
use crate::image_set::SECURITY_DATABASES;
use crate::reference::{validate_digest, ImageReference};
use crate::registry::{verify_digest, Blob, RawManifest, PLATFORM_ARCH, PLATFORM_OS};

/// Annotation holding the original image reference.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation holding the destination tag used at push time.
pub const ANNOTATION_SHORT_TAG: &str = "io.deckhouse.image.short_tag";

/// Annotation holding the index digest the source served, when the stored
/// manifest is its platform entry.
pub const ANNOTATION_SOURCE_DIGEST: &str = "io.deckhouse.image.source_digest";

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// `index.json` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub manifests: Vec<IndexEntry>,
}

impl Default for LayoutIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: OCI_IMAGE_INDEX_MEDIA_TYPE.to_string(),
            manifests: Vec::new(),
        }
    }
}

/// Manifest descriptor inside `index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl IndexEntry {
    /// Original reference the image was pulled from.
    pub fn reference(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_REF_NAME).map(String::as_str)
    }

    /// Tag (or digest) to publish the image under.
    pub fn short_tag(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_SHORT_TAG).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Platform {
    pub fn linux_amd64() -> Self {
        Self {
            architecture: PLATFORM_ARCH.to_string(),
            os: PLATFORM_OS.to_string(),
        }
    }
}

/// Handle to one layout directory.
///
/// Mutations need `&mut self`; one writer owns a handle at a time.
#[derive(Debug)]
pub struct ImageLayout {
    path: PathBuf,
    index: LayoutIndex,
}

impl ImageLayout {
    /// Create an empty layout at `path`.
    ///
    /// An existing layout at `path` is opened instead. Any other non-empty
    /// directory is refused.
    pub fn create_empty(path: &Path) -> Result<Self> {
        if is_layout(path) {
            return Self::open_existing(path);
        }
        if path.exists() && std::fs::read_dir(path)?.next().is_some() {
            return Err(MirrorError::LayoutInvalid(vec![format!(
                "{}: directory is not empty and is not an OCI layout",
                path.display()
            )]));
        }

        std::fs::create_dir_all(path.join("blobs").join("sha256")).map_err(|e| {
            MirrorError::Other(format!(
                "Failed to create layout {}: {}",
                path.display(),
                e
            ))
        })?;
        std::fs::write(path.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;

        let layout = Self {
            path: path.to_path_buf(),
            index: LayoutIndex::default(),
        };
        layout.save_index()?;
        tracing::debug!(path = %path.display(), "Created OCI layout");
        Ok(layout)
    }

    /// Open a layout that already exists on disk.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let marker = path.join(OCI_LAYOUT_FILE);
        if !marker.is_file() {
            return Err(MirrorError::LayoutInvalid(vec![format!(
                "{}: missing {}",
                path.display(),
                OCI_LAYOUT_FILE
            )]));
        }
        let data = std::fs::read(path.join(INDEX_FILE)).map_err(|e| {
            MirrorError::LayoutInvalid(vec![format!(
                "{}: cannot read {}: {}",
                path.display(),
                INDEX_FILE,
                e
            )])
        })?;
        let index: LayoutIndex = serde_json::from_slice(&data).map_err(|e| {
            MirrorError::LayoutInvalid(vec![format!(
                "{}: malformed {}: {}",
                path.display(),
                INDEX_FILE,
                e
            )])
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &LayoutIndex {
        &self.index
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.index.manifests
    }

    pub fn is_empty(&self) -> bool {
        self.index.manifests.is_empty()
    }

    /// Path of the blob named by `digest`.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        validate_digest(digest).map_err(MirrorError::Other)?;
        let hex = &digest["sha256:".len()..];
        Ok(self.path.join("blobs").join("sha256").join(hex))
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).map_or(false, |p| p.is_file())
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        std::fs::read(&path).map_err(|e| {
            MirrorError::Other(format!("Failed to read blob {}: {}", path.display(), e))
        })
    }

    /// Store a blob, verifying its content first.
    ///
    /// Blobs already present are left untouched.
    pub fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest)?;
        if path.is_file() {
            return Ok(());
        }
        verify_digest(digest, data)?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, data).map_err(|e| {
            MirrorError::Other(format!("Failed to write blob {}: {}", tmp_path.display(), e))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            MirrorError::Other(format!(
                "Failed to rename blob {} -> {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Entry recorded for `reference`, if any.
    pub fn find(&self, reference: &str) -> Option<&IndexEntry> {
        self.index
            .manifests
            .iter()
            .find(|entry| entry.reference() == Some(reference))
    }

    /// Whether `reference` is recorded with `digest` and its manifest blob
    /// is on disk. `digest` may be the manifest digest or the source index
    /// digest it was flattened from.
    pub fn contains(&self, reference: &str, digest: &str) -> bool {
        self.find(reference).map_or(false, |entry| {
            let matches = entry.digest == digest
                || entry.annotations.get(ANNOTATION_SOURCE_DIGEST).map(String::as_str) == Some(digest);
            matches && self.has_blob(&entry.digest)
        })
    }

    /// Write an image's blobs and record its manifest in `index.json`.
    ///
    /// Blobs land before the index entry, so an interrupted append leaves
    /// no entry behind. A previous entry for the same reference is replaced.
    pub fn append_image(
        &mut self,
        manifest: &RawManifest,
        blobs: &[Blob],
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        for blob in blobs {
            self.write_blob(&blob.descriptor.digest, &blob.data)?;
        }
        self.write_blob(&manifest.digest, &manifest.bytes)?;

        let entry = IndexEntry {
            media_type: manifest.media_type.clone(),
            digest: manifest.digest.clone(),
            size: manifest.bytes.len() as u64,
            annotations,
            platform: Some(Platform::linux_amd64()),
        };
        if let Some(reference) = entry.reference() {
            let reference = reference.to_string();
            self.index
                .manifests
                .retain(|existing| existing.reference() != Some(reference.as_str()));
        }
        self.index.manifests.push(entry);
        self.save_index()
    }

    /// Raw manifest of an index entry.
    pub fn read_manifest(&self, entry: &IndexEntry) -> Result<RawManifest> {
        let bytes = self.read_blob(&entry.digest)?;
        let mut manifest = RawManifest::from_bytes(bytes);
        if !entry.media_type.is_empty() {
            manifest.media_type = entry.media_type.clone();
        }
        Ok(manifest)
    }

    /// Manifest and blobs of an index entry, ready for upload.
    pub fn read_image(&self, entry: &IndexEntry) -> Result<(RawManifest, Vec<Blob>)> {
        let manifest = self.read_manifest(entry)?;
        let (config, layers) = manifest.blobs()?;
        let mut blobs = Vec::with_capacity(layers.len() + 1);
        for descriptor in std::iter::once(config).chain(layers) {
            let data = self.read_blob(&descriptor.digest)?;
            blobs.push(Blob { descriptor, data });
        }
        Ok((manifest, blobs))
    }

    /// Read a file out of the layer tree of an image in this layout.
    pub fn read_image_file(&self, entry: &IndexEntry, path: &str) -> Result<Option<Vec<u8>>> {
        let manifest = self.read_manifest(entry)?;
        let (_config, layers) = manifest.blobs()?;
        let mut contents = Vec::with_capacity(layers.len());
        for layer in &layers {
            contents.push(self.read_blob(&layer.digest)?);
        }
        find_file_in_layers(contents.iter().map(Vec::as_slice), path)
    }

    /// Save `index.json` atomically (write tmp, rename).
    fn save_index(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.index)?;
        let path = self.path.join(INDEX_FILE);
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data).map_err(|e| {
            MirrorError::Other(format!(
                "Failed to write index {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            MirrorError::Other(format!(
                "Failed to rename index {} -> {}: {}",
                tmp_path.display(),
                path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// Whether `path` holds an OCI layout marker and index.
pub fn is_layout(path: &Path) -> bool {
    path.join(OCI_LAYOUT_FILE).is_file() && path.join(INDEX_FILE).is_file()
}

/// Which layout of a [`LayoutSet`] an image belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Distribution,
    Installers,
    ReleaseChannels,
    SecurityDatabase(String),
    Module(String),
    ModuleReleases(String),
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Distribution => write!(f, "distribution"),
            Family::Installers => write!(f, "installers"),
            Family::ReleaseChannels => write!(f, "release channels"),
            Family::SecurityDatabase(name) => write!(f, "security database {}", name),
            Family::Module(name) => write!(f, "module {}", name),
            Family::ModuleReleases(name) => write!(f, "module {} releases", name),
        }
    }
}

/// The module and module-release layouts of one module.
#[derive(Debug)]
pub struct ModuleLayouts {
    pub module: ImageLayout,
    pub releases: ImageLayout,
}

/// Distribution, installer, release-channel and security database layouts.
#[derive(Debug)]
pub struct PlatformLayouts {
    pub distribution: ImageLayout,
    pub installers: ImageLayout,
    pub release_channels: ImageLayout,
    pub security: BTreeMap<String, ImageLayout>,
}

/// Every layout produced by one mirror operation.
///
/// For a distribution the tree under `WorkDir/<repo>` is:
/// `.`, `install`, `release-channel`, `security/<db>`, `modules/M`,
/// `modules/M/release`.
/// A module-only set (module sources) keeps modules directly under the root.
#[derive(Debug)]
pub struct LayoutSet {
    root: PathBuf,
    modules_dir: &'static str,
    platform: Option<PlatformLayouts>,
    modules: BTreeMap<String, ModuleLayouts>,
}

impl LayoutSet {
    /// Create (or reopen) the distribution layouts under `work_dir/repo`.
    pub fn create(work_dir: &Path, repo: &str) -> Result<Self> {
        let root = layout_root(work_dir, repo);
        let distribution = ImageLayout::create_empty(&root)?;
        let installers = ImageLayout::create_empty(&root.join("install"))?;
        let release_channels = ImageLayout::create_empty(&root.join("release-channel"))?;
        let mut security = BTreeMap::new();
        for (name, _) in SECURITY_DATABASES {
            security.insert(name.to_string(), ImageLayout::create_empty(&security_path(&root, name))?);
        }
        Ok(Self {
            root,
            modules_dir: "modules",
            platform: Some(PlatformLayouts {
                distribution,
                installers,
                release_channels,
                security,
            }),
            modules: BTreeMap::new(),
        })
    }

    /// Open the distribution layouts and every module found on disk.
    pub fn open(work_dir: &Path, repo: &str) -> Result<Self> {
        let root = layout_root(work_dir, repo);
        let mut security = BTreeMap::new();
        for (name, _) in SECURITY_DATABASES {
            security.insert(name.to_string(), ImageLayout::open_existing(&security_path(&root, name))?);
        }
        let platform = PlatformLayouts {
            distribution: ImageLayout::open_existing(&root)?,
            installers: ImageLayout::open_existing(&root.join("install"))?,
            release_channels: ImageLayout::open_existing(&root.join("release-channel"))?,
            security,
        };
        let mut set = Self {
            root,
            modules_dir: "modules",
            platform: Some(platform),
            modules: BTreeMap::new(),
        };
        set.open_modules()?;
        Ok(set)
    }

    /// Create an empty module-only set under `work_dir/registry`.
    pub fn create_modules_only(work_dir: &Path, registry: &str) -> Result<Self> {
        let root = layout_root(work_dir, registry);
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            modules_dir: "",
            platform: None,
            modules: BTreeMap::new(),
        })
    }

    /// Open a module-only set from disk.
    pub fn open_modules_only(work_dir: &Path, registry: &str) -> Result<Self> {
        let mut set = Self {
            root: layout_root(work_dir, registry),
            modules_dir: "",
            platform: None,
            modules: BTreeMap::new(),
        };
        set.open_modules()?;
        Ok(set)
    }

    fn open_modules(&mut self) -> Result<()> {
        let dir = self.root.join(self.modules_dir);
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_dir() || !is_layout(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let layouts = ModuleLayouts {
                module: ImageLayout::open_existing(&path)?,
                releases: ImageLayout::open_existing(&path.join("release"))?,
            };
            self.modules.insert(name, layouts);
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the two layouts of module `name`; existing ones are reopened.
    pub fn add_module(&mut self, name: &str) -> Result<()> {
        if self.modules.contains_key(name) {
            return Ok(());
        }
        let path = self.root.join(self.modules_dir).join(name);
        let module = ImageLayout::create_empty(&path)?;
        let releases = ImageLayout::create_empty(&path.join("release"))?;
        self.modules
            .insert(name.to_string(), ModuleLayouts { module, releases });
        Ok(())
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn platform(&self) -> Option<&PlatformLayouts> {
        self.platform.as_ref()
    }

    /// Repository suffix of a family, relative to the set's repository.
    pub fn suffix(&self, family: &Family) -> String {
        let modules = if self.modules_dir.is_empty() {
            String::new()
        } else {
            format!("/{}", self.modules_dir)
        };
        match family {
            Family::Distribution => String::new(),
            Family::Installers => "/install".to_string(),
            Family::ReleaseChannels => "/release-channel".to_string(),
            Family::SecurityDatabase(name) => format!("/security/{}", name),
            Family::Module(name) => format!("{}/{}", modules, name),
            Family::ModuleReleases(name) => format!("{}/{}/release", modules, name),
        }
    }

    /// Repository holding a module's tags, relative to the set's repository.
    pub fn modules_suffix(&self) -> String {
        if self.modules_dir.is_empty() {
            String::new()
        } else {
            format!("/{}", self.modules_dir)
        }
    }

    pub fn get(&self, family: &Family) -> Option<&ImageLayout> {
        match family {
            Family::Distribution => self.platform.as_ref().map(|p| &p.distribution),
            Family::Installers => self.platform.as_ref().map(|p| &p.installers),
            Family::ReleaseChannels => self.platform.as_ref().map(|p| &p.release_channels),
            Family::SecurityDatabase(name) => self.platform.as_ref().and_then(|p| p.security.get(name)),
            Family::Module(name) => self.modules.get(name).map(|m| &m.module),
            Family::ModuleReleases(name) => self.modules.get(name).map(|m| &m.releases),
        }
    }

    pub fn get_mut(&mut self, family: &Family) -> Option<&mut ImageLayout> {
        match family {
            Family::Distribution => self.platform.as_mut().map(|p| &mut p.distribution),
            Family::Installers => self.platform.as_mut().map(|p| &mut p.installers),
            Family::ReleaseChannels => self.platform.as_mut().map(|p| &mut p.release_channels),
            Family::SecurityDatabase(name) => self.platform.as_mut().and_then(|p| p.security.get_mut(name)),
            Family::Module(name) => self.modules.get_mut(name).map(|m| &mut m.module),
            Family::ModuleReleases(name) => self.modules.get_mut(name).map(|m| &mut m.releases),
        }
    }

    /// Every layout in push order: platform layouts, then modules.
    pub fn layouts(&self) -> Vec<(Family, &ImageLayout)> {
        let mut layouts = Vec::new();
        if let Some(platform) = &self.platform {
            layouts.push((Family::Distribution, &platform.distribution));
            layouts.push((Family::Installers, &platform.installers));
            layouts.push((Family::ReleaseChannels, &platform.release_channels));
            for (name, layout) in &platform.security {
                layouts.push((Family::SecurityDatabase(name.clone()), layout));
            }
        }
        for (name, module) in &self.modules {
            layouts.push((Family::Module(name.clone()), &module.module));
            layouts.push((Family::ModuleReleases(name.clone()), &module.releases));
        }
        layouts
    }

    /// Mutable handles to every layout, each handed out once.
    pub fn layouts_mut(&mut self) -> Vec<(Family, &mut ImageLayout)> {
        let mut layouts = Vec::new();
        if let Some(platform) = &mut self.platform {
            layouts.push((Family::Distribution, &mut platform.distribution));
            layouts.push((Family::Installers, &mut platform.installers));
            layouts.push((Family::ReleaseChannels, &mut platform.release_channels));
            for (name, layout) in &mut platform.security {
                layouts.push((Family::SecurityDatabase(name.clone()), layout));
            }
        }
        for (name, module) in &mut self.modules {
            layouts.push((Family::Module(name.clone()), &mut module.module));
            layouts.push((Family::ModuleReleases(name.clone()), &mut module.releases));
        }
        layouts
    }
}

fn security_path(root: &Path, name: &str) -> PathBuf {
    root.join("security").join(name)
}

/// `work_dir/<repo>` with the repository's path components as directories.
pub fn layout_root(work_dir: &Path, repo: &str) -> PathBuf {
    repo.trim_matches('/')
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .fold(work_dir.to_path_buf(), |path, component| path.join(component))
}

/// Annotations recorded for an image pulled from `reference`.
pub fn pull_annotations(reference: &ImageReference, manifest_digest: &str) -> BTreeMap<String, String> {
    let short_tag = if reference.is_digested() {
        manifest_digest.to_string()
    } else {
        reference.short_tag().to_string()
    };
    BTreeMap::from([
        (ANNOTATION_REF_NAME.to_string(), reference.to_string()),
        (ANNOTATION_SHORT_TAG.to_string(), short_tag),
    ])
}
