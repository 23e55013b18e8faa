//! Image closure computation.
//!
//! An [`ImageSet`] lists the references destined for one layout.
//! [`ImageSetBuilder`] fills the sets phase by phase; the phases that read
//! image content run after the corresponding pull.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use d8_mirror_core::error::{MirrorError, Result};
use d8_mirror_core::filter::ModuleFilter;

use crate::layout::{Family, ImageLayout};
use crate::reference::ImageReference;
use crate::release::{release_tag_from_layout, version_tag};
use crate::versions::CHANNELS;

/// File listing the component images of an installer or module image.
pub const IMAGES_DIGESTS_FILE: &str = "images_digests.json";

/// Location of the component digest list inside installer images.
pub const INSTALLER_DIGESTS_PATH: &str = "deckhouse/candi/images_digests.json";

/// Bundled module images of a distribution image, by digest.
pub const MODULES_DIGESTS_PATH: &str = "deckhouse/modules/images_digests.json";

/// Older distribution images list bundled module images by tag instead.
pub const MODULES_TAGS_PATH: &str = "deckhouse/modules/images_tags.json";

/// Vulnerability databases under `<repo>/security`, with the tag mirrored.
pub const SECURITY_DATABASES: [(&str, &str); 4] = [
    ("trivy-db", "2"),
    ("trivy-bdu", "1"),
    ("trivy-java-db", "1"),
    ("trivy-checks", "0"),
];

/// Whether a missing image fails the pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Required,
    Optional,
}

/// References destined for one layout, in stable order.
///
/// A reference handed to a pull is marked dispatched and is not handed out
/// again, so the later phases of a pipeline only pull what they added.
#[derive(Debug, Clone, Default)]
pub struct ImageSet {
    references: BTreeMap<ImageReference, Requirement>,
    dispatched: BTreeSet<ImageReference>,
}

impl ImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference that must exist.
    ///
    /// Upgrading a dispatched optional reference makes it pending again.
    pub fn require(&mut self, reference: ImageReference) {
        if self.references.insert(reference.clone(), Requirement::Required) == Some(Requirement::Optional) {
            self.dispatched.remove(&reference);
        }
    }

    /// Add a reference that may be absent; never downgrades a required one.
    pub fn allow(&mut self, reference: ImageReference) {
        if let Entry::Vacant(slot) = self.references.entry(reference) {
            slot.insert(Requirement::Optional);
        }
    }

    pub fn contains(&self, reference: &ImageReference) -> bool {
        self.references.contains_key(reference)
    }

    pub fn requirement(&self, reference: &ImageReference) -> Option<Requirement> {
        self.references.get(reference).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ImageReference, Requirement)> {
        self.references.iter().map(|(r, req)| (r, *req))
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Number of references not yet dispatched.
    pub fn pending(&self) -> usize {
        self.references.len() - self.dispatched.len()
    }

    /// Move every undispatched reference into a new set.
    fn take_pending(&mut self) -> ImageSet {
        let mut pending = ImageSet::new();
        for (reference, requirement) in &self.references {
            if self.dispatched.insert(reference.clone()) {
                pending.references.insert(reference.clone(), *requirement);
            }
        }
        pending
    }
}

/// Image sets keyed by the layout they fill.
#[derive(Debug, Clone, Default)]
pub struct ImageSets {
    sets: BTreeMap<Family, ImageSet>,
}

impl ImageSets {
    pub fn get(&self, family: &Family) -> Option<&ImageSet> {
        self.sets.get(family)
    }

    pub fn entry(&mut self, family: Family) -> &mut ImageSet {
        self.sets.entry(family).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Family, &ImageSet)> {
        self.sets.iter()
    }

    /// Total number of references across all sets.
    pub fn total(&self) -> usize {
        self.sets.values().map(ImageSet::len).sum()
    }

    /// Undispatched references of the families `pick` accepts, marking them
    /// dispatched.
    pub fn take_pending<F>(&mut self, pick: F) -> ImageSets
    where
        F: Fn(&Family) -> bool,
    {
        let sets = self
            .sets
            .iter_mut()
            .filter(|(family, _)| pick(family))
            .map(|(family, set)| (family.clone(), set.take_pending()))
            .filter(|(_, set)| !set.is_empty())
            .collect();
        ImageSets { sets }
    }
}

/// An add-on module and the release tags found for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub registry_path: String,
    pub releases: Vec<String>,
}

/// Fills [`ImageSets`] for one source repository.
pub struct ImageSetBuilder {
    repo: String,
    modules_repo: String,
}

impl ImageSetBuilder {
    /// Builder for a distribution at `repo`; modules live at `repo/modules`.
    pub fn new(repo: &str) -> Self {
        let repo = repo.trim_matches('/').to_string();
        let modules_repo = format!("{}/modules", repo);
        Self { repo, modules_repo }
    }

    /// Builder for a module source whose modules live directly under `registry`.
    pub fn for_module_source(registry: &str) -> Self {
        let registry = registry.trim_matches('/').to_string();
        Self {
            repo: registry.clone(),
            modules_repo: registry,
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn modules_repo(&self) -> &str {
        &self.modules_repo
    }

    fn family_repo(&self, family: &Family) -> String {
        match family {
            Family::Distribution => self.repo.clone(),
            Family::Installers => format!("{}/install", self.repo),
            Family::ReleaseChannels => format!("{}/release-channel", self.repo),
            Family::SecurityDatabase(name) => format!("{}/security/{}", self.repo, name),
            Family::Module(name) => format!("{}/{}", self.modules_repo, name),
            Family::ModuleReleases(name) => format!("{}/{}/release", self.modules_repo, name),
        }
    }

    fn tagged(&self, family: &Family, tag: &str) -> Result<ImageReference> {
        ImageReference::tagged(&self.family_repo(family), tag)
    }

    /// Seed the three platform families with the channel tags.
    pub fn seed_channels(&self, sets: &mut ImageSets) -> Result<()> {
        for family in [Family::Distribution, Family::Installers, Family::ReleaseChannels] {
            for channel in CHANNELS {
                let reference = self.tagged(&family, channel)?;
                sets.entry(family.clone()).require(reference);
            }
        }
        Ok(())
    }

    /// Add `v<version>` tags of every version to the three platform families.
    pub fn expand_versions<'v, I>(&self, sets: &mut ImageSets, versions: I) -> Result<()>
    where
        I: IntoIterator<Item = &'v semver::Version>,
    {
        for version in versions {
            let tag = version_tag(version);
            for family in [Family::Distribution, Family::Installers, Family::ReleaseChannels] {
                let reference = self.tagged(&family, &tag)?;
                sets.entry(family.clone()).require(reference);
            }
        }
        Ok(())
    }

    /// Seed the vulnerability databases. Editions without them still mirror,
    /// so each is optional.
    pub fn seed_security_databases(&self, sets: &mut ImageSets) -> Result<()> {
        for (name, tag) in SECURITY_DATABASES {
            let family = Family::SecurityDatabase(name.to_string());
            let reference = self.tagged(&family, tag)?;
            sets.entry(family).allow(reference);
        }
        Ok(())
    }

    /// Add every component digest named by the pulled installer images to
    /// the distribution set. Returns the number of digests added.
    pub fn extract_installer_digests(&self, sets: &mut ImageSets, installers: &ImageLayout) -> Result<usize> {
        let mut digests = Vec::new();
        for entry in installers.entries() {
            let data = installers.read_image_file(entry, INSTALLER_DIGESTS_PATH)?.ok_or_else(|| {
                MirrorError::Other(format!(
                    "{}: missing {}",
                    entry.reference().unwrap_or(&entry.digest),
                    INSTALLER_DIGESTS_PATH
                ))
            })?;
            digests.extend(collect_digests(&data)?);
        }
        self.add_digests(sets, Family::Distribution, &self.repo, digests)
    }

    /// Add the module images bundled with each pulled distribution image.
    ///
    /// The digest list is read first and the tag list is the fallback;
    /// images carrying neither contribute nothing. Returns the number of
    /// references added.
    pub fn extract_bundled_module_images(
        &self,
        sets: &mut ImageSets,
        distribution: &ImageLayout,
    ) -> Result<usize> {
        let mut identifiers = BTreeSet::new();
        for entry in distribution.entries() {
            if entry.reference().map_or(true, |r| r.contains('@')) {
                continue;
            }
            let data = match distribution.read_image_file(entry, MODULES_DIGESTS_PATH)? {
                Some(data) => Some(data),
                None => distribution.read_image_file(entry, MODULES_TAGS_PATH)?,
            };
            match data {
                Some(data) => identifiers.extend(collect_module_images(&data)?),
                None => tracing::debug!(
                    reference = entry.reference().unwrap_or(&entry.digest),
                    "No bundled module image list"
                ),
            }
        }

        let set = sets.entry(Family::Distribution);
        let before = set.len();
        for identifier in identifiers {
            let reference = if identifier.starts_with("sha256:") {
                ImageReference::digested(&self.repo, &identifier)?
            } else {
                ImageReference::tagged(&self.repo, &identifier)?
            };
            set.require(reference);
        }
        Ok(set.len() - before)
    }

    /// Seed a module's release set.
    ///
    /// Without a filter the channel heads are added; with one, only the
    /// filtered releases. Both are optional since any of them may be absent.
    pub fn seed_module(&self, sets: &mut ImageSets, module: &Module, filter: &ModuleFilter) -> Result<()> {
        let family = Family::ModuleReleases(module.name.clone());
        let set = sets.entry(family.clone());
        if filter.is_empty() {
            for channel in CHANNELS {
                set.allow(self.tagged(&family, channel)?);
            }
        } else {
            for release in filter.filter_releases(&module.name, &module.releases) {
                set.allow(self.tagged(&family, &release)?);
            }
        }
        sets.entry(Family::Module(module.name.clone()));
        Ok(())
    }

    /// Add `v<version>` for each pulled module release to the module and
    /// module-release sets. Returns the versions found.
    pub fn expand_module_versions(
        &self,
        sets: &mut ImageSets,
        module: &str,
        releases: &ImageLayout,
    ) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for entry in releases.entries() {
            let tag = release_tag_from_layout(releases, entry)?;
            if !found.contains(&tag) {
                found.push(tag);
            }
        }
        for tag in &found {
            let module_ref = self.tagged(&Family::Module(module.to_string()), tag)?;
            sets.entry(Family::Module(module.to_string())).require(module_ref);
            let release_ref = self.tagged(&Family::ModuleReleases(module.to_string()), tag)?;
            sets.entry(Family::ModuleReleases(module.to_string())).allow(release_ref);
        }
        Ok(found)
    }

    /// Add component digests named by the pulled module images.
    ///
    /// Module images without a digest list contribute nothing.
    pub fn extract_module_digests(
        &self,
        sets: &mut ImageSets,
        module: &str,
        layout: &ImageLayout,
    ) -> Result<usize> {
        let mut digests = Vec::new();
        for entry in layout.entries() {
            if entry.reference().map_or(false, |r| r.contains('@')) {
                continue;
            }
            if let Some(data) = layout.read_image_file(entry, IMAGES_DIGESTS_FILE)? {
                digests.extend(collect_digests(&data)?);
            }
        }
        let family = Family::Module(module.to_string());
        let repo = self.family_repo(&family);
        self.add_digests(sets, family, &repo, digests)
    }

    fn add_digests(
        &self,
        sets: &mut ImageSets,
        family: Family,
        repo: &str,
        digests: Vec<String>,
    ) -> Result<usize> {
        let set = sets.entry(family);
        let before = set.len();
        for digest in digests {
            set.require(ImageReference::digested(repo, &digest)?);
        }
        Ok(set.len() - before)
    }
}

/// Image identifiers (digests or tags) of a `module -> image -> id` map.
pub fn collect_module_images(data: &[u8]) -> Result<Vec<String>> {
    let modules: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_slice(data)?;
    let mut identifiers: Vec<String> = modules
        .into_values()
        .flat_map(BTreeMap::into_values)
        .filter(|id| !id.is_empty())
        .collect();
    identifiers.sort();
    identifiers.dedup();
    Ok(identifiers)
}

/// Every string leaf starting with `sha256:` in a JSON document.
pub fn collect_digests(data: &[u8]) -> Result<Vec<String>> {
    let document: serde_json::Value = serde_json::from_slice(data)?;
    let mut digests = Vec::new();
    collect_leaves(&document, &mut digests);
    digests.sort();
    digests.dedup();
    Ok(digests)
}

fn collect_leaves(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if s.starts_with("sha256:") => out.push(s.clone()),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_leaves(v, out)),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_leaves(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: &str = "r.example.com/deckhouse/ee";
    const DIGEST_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn names(set: &ImageSet) -> Vec<String> {
        set.iter().map(|(r, _)| r.to_string()).collect()
    }

    #[test]
    fn test_seed_and_expand() {
        let builder = ImageSetBuilder::new(REPO);
        let mut sets = ImageSets::default();
        builder.seed_channels(&mut sets).unwrap();
        builder
            .expand_versions(&mut sets, &[semver::Version::new(1, 56, 5)])
            .unwrap();

        let installers = names(sets.get(&Family::Installers).unwrap());
        assert_eq!(installers.len(), 6);
        assert!(installers.contains(&format!("{REPO}/install:rock-solid")));
        assert!(installers.contains(&format!("{REPO}/install:v1.56.5")));
        assert!(names(sets.get(&Family::ReleaseChannels).unwrap())
            .contains(&format!("{REPO}/release-channel:v1.56.5")));
        assert!(names(sets.get(&Family::Distribution).unwrap()).contains(&format!("{REPO}:early-access")));
        assert_eq!(sets.total(), 18);
    }

    #[test]
    fn test_collect_digests_nested_and_flat() {
        let nested = format!(
            r#"{{"common":{{"alpine":"{DIGEST_A}"}},"controlPlane":{{"apiserver":"{DIGEST_B}","note":"x"}}}}"#
        );
        assert_eq!(collect_digests(nested.as_bytes()).unwrap(), vec![DIGEST_A, DIGEST_B]);
        let flat = format!(r#"{{"a":"{DIGEST_B}","b":"{DIGEST_B}"}}"#);
        assert_eq!(collect_digests(flat.as_bytes()).unwrap(), vec![DIGEST_B]);
        assert!(collect_digests(b"nope").is_err());
    }

    #[test]
    fn test_optional_never_downgrades_required() {
        let mut set = ImageSet::new();
        let r = ImageReference::parse(&format!("{REPO}:alpha")).unwrap();
        set.require(r.clone());
        set.allow(r.clone());
        assert_eq!(set.requirement(&r), Some(Requirement::Required));

        let o = ImageReference::parse(&format!("{REPO}:beta")).unwrap();
        set.allow(o.clone());
        set.require(o.clone());
        assert_eq!(set.requirement(&o), Some(Requirement::Required));
    }

    #[test]
    fn test_seed_module_with_filter() {
        let builder = ImageSetBuilder::new(REPO);
        let mut sets = ImageSets::default();
        let module = Module {
            name: "admin".into(),
            registry_path: format!("{REPO}/modules/admin"),
            releases: vec!["v1".into(), "v2".into(), "v3".into()],
        };
        let filter = ModuleFilter::parse("admin:v1;admin:v2;monitoring:v9");
        builder.seed_module(&mut sets, &module, &filter).unwrap();

        let releases = sets.get(&Family::ModuleReleases("admin".into())).unwrap();
        assert_eq!(
            names(releases),
            vec![
                format!("{REPO}/modules/admin/release:v1"),
                format!("{REPO}/modules/admin/release:v2"),
            ]
        );
        assert!(releases.iter().all(|(_, req)| req == Requirement::Optional));
        assert!(sets.get(&Family::Module("admin".into())).unwrap().is_empty());
    }

    #[test]
    fn test_seed_module_without_filter_uses_channels() {
        let builder = ImageSetBuilder::for_module_source("r.example.com/modules");
        let mut sets = ImageSets::default();
        let module = Module {
            name: "op".into(),
            registry_path: "r.example.com/modules/op".into(),
            releases: vec![],
        };
        builder
            .seed_module(&mut sets, &module, &ModuleFilter::default())
            .unwrap();
        let releases = names(sets.get(&Family::ModuleReleases("op".into())).unwrap());
        assert_eq!(releases.len(), 5);
        assert!(releases.contains(&"r.example.com/modules/op/release:stable".to_string()));
    }

    #[test]
    fn test_take_pending_hands_out_each_reference_once() {
        let mut sets = ImageSets::default();
        let alpha = ImageReference::parse(&format!("{REPO}:alpha")).unwrap();
        sets.entry(Family::Distribution).require(alpha);
        sets.entry(Family::Installers)
            .require(ImageReference::parse(&format!("{REPO}/install:alpha")).unwrap());

        let first = sets.take_pending(|f| *f == Family::Distribution);
        assert_eq!(first.total(), 1);
        assert!(first.get(&Family::Installers).is_none());
        assert_eq!(sets.take_pending(|f| *f == Family::Distribution).total(), 0);

        let beta = ImageReference::parse(&format!("{REPO}:beta")).unwrap();
        sets.entry(Family::Distribution).require(beta.clone());
        let second = sets.take_pending(|_| true);
        assert_eq!(second.total(), 2);
        assert!(second.get(&Family::Distribution).unwrap().contains(&beta));
        assert_eq!(sets.get(&Family::Distribution).unwrap().len(), 2);
        assert_eq!(sets.get(&Family::Distribution).unwrap().pending(), 0);
    }

    #[test]
    fn test_required_upgrade_is_pending_again() {
        let mut sets = ImageSets::default();
        let reference = ImageReference::parse(&format!("{REPO}/modules/op/release:v1")).unwrap();
        let family = Family::ModuleReleases("op".into());
        sets.entry(family.clone()).allow(reference.clone());
        assert_eq!(sets.take_pending(|_| true).total(), 1);

        sets.entry(family.clone()).require(reference.clone());
        let pending = sets.take_pending(|_| true);
        assert_eq!(pending.get(&family).unwrap().requirement(&reference), Some(Requirement::Required));
    }

    #[test]
    fn test_seed_security_databases() {
        let builder = ImageSetBuilder::new(REPO);
        let mut sets = ImageSets::default();
        builder.seed_security_databases(&mut sets).unwrap();

        let trivy = sets.get(&Family::SecurityDatabase("trivy-db".into())).unwrap();
        assert_eq!(names(trivy), vec![format!("{REPO}/security/trivy-db:2")]);
        assert!(trivy.iter().all(|(_, req)| req == Requirement::Optional));
        assert_eq!(sets.total(), SECURITY_DATABASES.len());
    }

    fn append_tagged(layout: &mut ImageLayout, tag: &str, files: &[(&str, &[u8])]) {
        let image = crate::image::build_image(files).unwrap();
        let blobs: Vec<_> = image.blobs().cloned().collect();
        let reference = ImageReference::tagged(REPO, tag).unwrap();
        layout
            .append_image(
                &image.manifest,
                &blobs,
                crate::layout::pull_annotations(&reference, &image.manifest.digest),
            )
            .unwrap();
    }

    #[test]
    fn test_bundled_module_images_prefer_digests_and_fall_back_to_tags() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut layout = ImageLayout::create_empty(tmp.path()).unwrap();
        let digests = format!(r#"{{"cniCilium":{{"agent":"{DIGEST_A}","operator":"{DIGEST_B}"}}}}"#);
        let tags = r#"{"ingressNginx":{"controller":"v1.55.7-ingress-nginx-controller"}}"#;
        append_tagged(
            &mut layout,
            "v1.56.5",
            &[(MODULES_DIGESTS_PATH, digests.as_bytes()), (MODULES_TAGS_PATH, &b"{}"[..])],
        );
        append_tagged(&mut layout, "v1.55.7", &[(MODULES_TAGS_PATH, tags.as_bytes())]);
        append_tagged(&mut layout, "v1.54.0", &[("deckhouse/version", &b"v1.54.0"[..])]);

        let builder = ImageSetBuilder::new(REPO);
        let mut sets = ImageSets::default();
        let added = builder.extract_bundled_module_images(&mut sets, &layout).unwrap();
        assert_eq!(added, 3);
        let distribution = names(sets.get(&Family::Distribution).unwrap());
        assert!(distribution.contains(&format!("{REPO}@{DIGEST_A}")));
        assert!(distribution.contains(&format!("{REPO}@{DIGEST_B}")));
        assert!(distribution.contains(&format!("{REPO}:v1.55.7-ingress-nginx-controller")));
    }

    #[test]
    fn test_collect_module_images_rejects_flat_maps() {
        assert!(collect_module_images(format!(r#"{{"a":"{DIGEST_A}"}}"#).as_bytes()).is_err());
        assert_eq!(
            collect_module_images(format!(r#"{{"a":{{"x":"{DIGEST_A}","y":"{DIGEST_A}"}}}}"#).as_bytes()).unwrap(),
            vec![DIGEST_A.to_string()]
        );
    }
}
