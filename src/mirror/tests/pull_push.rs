//! End-to-end pull and push against in-memory registries.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{publish_version, point_channel, put, two_version_source, SOURCE_REPO};
use d8_mirror::layout::{layout_root, ANNOTATION_REF_NAME, ANNOTATION_SHORT_TAG};
use d8_mirror::registry::MemoryRegistry;
use d8_mirror::{
    pull_to_local_fs, push_from_local_fs, Family, ImageLayout, LayoutSet, MirrorContext,
    MirrorError, MirrorOperation, VersionResolver, CHANNELS,
};
use d8_mirror_core::config::{RetryConfig, ValidationMode};
use tempfile::TempDir;

const DEST_HOST: &str = "mirror.internal:5000";
const DEST_PATH: &str = "deckhouse/ee";

fn context(tmp: &TempDir) -> MirrorContext {
    MirrorContext {
        insecure: true,
        source_repo: SOURCE_REPO.to_string(),
        registry_host: DEST_HOST.to_string(),
        registry_path: DEST_PATH.to_string(),
        work_dir: tmp.path().join("work"),
        validation_mode: ValidationMode::Full,
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..Default::default()
    }
}

fn version(s: &str) -> semver::Version {
    semver::Version::parse(s).unwrap()
}

#[tokio::test]
async fn test_two_version_pull_then_push() {
    let (source, published) = two_version_source();
    let source = Arc::new(source);
    let tmp = TempDir::new().unwrap();
    let ctx = MirrorContext {
        release_manifests_path: Some(tmp.path().join("releases.yaml")),
        ..context(&tmp)
    };

    let op = MirrorOperation::new(ctx.clone(), source.clone());
    let report = pull_to_local_fs(&op, None).await.unwrap();
    assert_eq!(
        report.versions.into_iter().collect::<Vec<_>>(),
        vec![version("1.55.7"), version("1.56.5")]
    );
    assert!(report.modules.is_empty());
    assert!(report.bundle.is_none());

    let root = layout_root(&ctx.work_dir, SOURCE_REPO);
    assert!(root.join("blobs/sha256").is_dir());
    let distribution = ImageLayout::open_existing(&root).unwrap();
    for components in &published {
        for digest in [&components.alpine, &components.bashible_apiserver] {
            let entry = distribution
                .find(&format!("{SOURCE_REPO}@{digest}"))
                .unwrap_or_else(|| panic!("component {digest} not pulled"));
            assert_eq!(&entry.annotations[ANNOTATION_SHORT_TAG], digest);
            assert!(distribution.has_blob(digest));
        }
        assert!(
            distribution.find(&format!("{SOURCE_REPO}@{}", components.cilium_agent)).is_some(),
            "bundled module image {} not pulled",
            components.cilium_agent
        );
    }

    let trivy = ImageLayout::open_existing(&root.join("security/trivy-db")).unwrap();
    assert_eq!(trivy.entries().len(), 1);
    assert_eq!(trivy.entries()[0].short_tag(), Some("2"));
    assert_eq!(report.images.missing, 0);

    let installers = ImageLayout::open_existing(&root.join("install")).unwrap();
    let channels = ImageLayout::open_existing(&root.join("release-channel")).unwrap();
    for layout in [&distribution, &installers, &channels] {
        for tag in CHANNELS.iter().copied().chain(["v1.55.7", "v1.56.5"]) {
            let matching: Vec<_> = layout
                .entries()
                .iter()
                .filter(|e| e.annotations.get(ANNOTATION_SHORT_TAG).map(String::as_str) == Some(tag))
                .collect();
            assert_eq!(matching.len(), 1, "{} in {}", tag, layout.path().display());
            assert!(matching[0].annotations[ANNOTATION_REF_NAME].ends_with(&format!(":{tag}")));
        }
    }

    let destination = Arc::new(MemoryRegistry::new());
    let op = MirrorOperation::new(ctx.clone(), source.clone()).with_destination(destination.clone());
    let pushed = push_from_local_fs(&op).await.unwrap();
    assert_eq!(pushed.images.module_tags, 0);
    assert!(pushed.images.images > 0);

    let dest_repo = format!("{DEST_HOST}/{DEST_PATH}");
    let mut expected_tags: Vec<String> = CHANNELS.iter().map(|c| c.to_string()).collect();
    expected_tags.extend(["v1.55.7".to_string(), "v1.56.5".to_string()]);
    expected_tags.sort();
    for repository in [
        dest_repo.clone(),
        format!("{dest_repo}/install"),
        format!("{dest_repo}/release-channel"),
    ] {
        assert_eq!(destination.tags(&repository), expected_tags, "{repository}");
    }
    assert_eq!(destination.tags(&format!("{dest_repo}/security/trivy-db")), vec!["2"]);
    assert_eq!(destination.tags(&format!("{dest_repo}/security/trivy-checks")), vec!["0"]);

    let dest_blobs = destination.blob_digests();
    assert!(!dest_blobs.is_empty());
    assert!(dest_blobs.is_subset(&source.blob_digests()));

    let manifests = std::fs::read_to_string(pushed.release_manifests.unwrap()).unwrap();
    assert_eq!(manifests.matches("kind: DeckhouseRelease").count(), 2);
    let first = manifests.find("name: v1.55.7").unwrap();
    let second = manifests.find("name: v1.56.5").unwrap();
    assert!(first < second);
}

#[tokio::test]
async fn test_pull_through_bundle_and_push() {
    let (source, _) = two_version_source();
    let source = Arc::new(source);
    let tmp = TempDir::new().unwrap();
    let ctx = MirrorContext {
        bundle_path: Some(tmp.path().join("bundle/d8.tar")),
        chunk_size: 4096,
        ..context(&tmp)
    };

    let op = MirrorOperation::new(ctx.clone(), source.clone());
    let report = pull_to_local_fs(&op, None).await.unwrap();
    let bundle = report.bundle.unwrap();
    assert!(bundle.chunks.len() > 1);
    assert!(bundle.chunks.iter().all(|c| c.gostsum.is_some()));
    assert!(!layout_root(&ctx.work_dir, SOURCE_REPO).join("index.json").exists());

    // Across the air gap: a fresh work dir next to the bundle.
    let ctx = MirrorContext {
        work_dir: tmp.path().join("restored"),
        ..ctx
    };
    let destination = Arc::new(MemoryRegistry::new());
    let op = MirrorOperation::new(ctx, Arc::new(MemoryRegistry::new())).with_destination(destination.clone());
    let pushed = push_from_local_fs(&op).await.unwrap();
    assert_eq!(pushed.unpacked.unwrap().chunks, bundle.chunks.len());
    assert!(destination.blob_digests().is_subset(&source.blob_digests()));
    assert!(destination
        .tags(&format!("{DEST_HOST}/{DEST_PATH}/release-channel"))
        .contains(&"stable".to_string()));
}

#[tokio::test]
async fn test_second_pull_resumes() {
    let (source, _) = two_version_source();
    let source = Arc::new(source);
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);

    let first = pull_to_local_fs(&MirrorOperation::new(ctx.clone(), source.clone()), None)
        .await
        .unwrap();
    assert!(first.images.pulled > 0);

    let second = pull_to_local_fs(&MirrorOperation::new(ctx.clone(), source.clone()), None)
        .await
        .unwrap();
    assert_eq!(second.images.pulled, 0);
    assert_eq!(second.images.skipped, first.images.pulled);

    let set = LayoutSet::open(&ctx.work_dir, SOURCE_REPO).unwrap();
    let installers = set.get(&Family::Installers).unwrap();
    assert_eq!(installers.entries().len(), CHANNELS.len() + 2);
}

#[tokio::test]
async fn test_missing_security_databases_are_optional() {
    let registry = MemoryRegistry::new();
    let published = publish_version(&registry, SOURCE_REPO, "v1.56.5", false);
    for channel in CHANNELS {
        point_channel(&registry, &published, channel);
    }

    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let report = pull_to_local_fs(&MirrorOperation::new(ctx.clone(), Arc::new(registry)), None)
        .await
        .unwrap();
    assert_eq!(report.images.missing, 4);
    let set = LayoutSet::open(&ctx.work_dir, SOURCE_REPO).unwrap();
    assert!(set.get(&Family::SecurityDatabase("trivy-db".into())).unwrap().is_empty());
}

#[tokio::test]
async fn test_pull_mirrors_distribution_modules() {
    let (source, _) = two_version_source();
    let modules = format!("{SOURCE_REPO}/modules");
    put(&source, &modules, Some("admin"), &[("module", b"admin")]);
    let component = put(&source, &format!("{modules}/admin"), None, &[("bin/admin", b"admin v1.2.0")]);
    let digests = serde_json::json!({ "controller": component }).to_string();
    put(
        &source,
        &format!("{modules}/admin"),
        Some("v1.2.0"),
        &[("images_digests.json", digests.as_bytes())],
    );
    let release = put(
        &source,
        &format!("{modules}/admin/release"),
        Some("v1.2.0"),
        &[("version.json", br#"{"version":"v1.2.0"}"#)],
    );
    for channel in CHANNELS {
        source.tag(&format!("{modules}/admin/release"), channel, &release);
    }

    let source = Arc::new(source);
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let report = pull_to_local_fs(&MirrorOperation::new(ctx.clone(), source.clone()), None)
        .await
        .unwrap();
    assert_eq!(report.modules, vec!["admin".to_string()]);

    let set = LayoutSet::open(&ctx.work_dir, SOURCE_REPO).unwrap();
    let short_tags = |family: Family| -> BTreeSet<String> {
        set.get(&family)
            .unwrap()
            .entries()
            .iter()
            .filter_map(|e| e.short_tag().map(str::to_string))
            .collect()
    };
    let mut expected_releases: BTreeSet<String> = CHANNELS.iter().map(|c| c.to_string()).collect();
    expected_releases.insert("v1.2.0".to_string());
    assert_eq!(short_tags(Family::ModuleReleases("admin".into())), expected_releases);
    assert_eq!(
        short_tags(Family::Module("admin".into())),
        BTreeSet::from(["v1.2.0".to_string(), component.clone()])
    );

    let destination = Arc::new(MemoryRegistry::new());
    let op = MirrorOperation::new(ctx, source).with_destination(destination.clone());
    let pushed = push_from_local_fs(&op).await.unwrap();
    assert_eq!(pushed.images.module_tags, 1);
    let dest_modules = format!("{DEST_HOST}/{DEST_PATH}/modules");
    assert_eq!(destination.tags(&dest_modules), vec!["admin"]);
    assert_eq!(destination.tags(&format!("{dest_modules}/admin")), vec!["v1.2.0"]);
    assert!(destination
        .tags(&format!("{dest_modules}/admin/release"))
        .contains(&"v1.2.0".to_string()));
}

#[tokio::test]
async fn test_explicit_versions_skip_resolution() {
    let (source, _) = two_version_source();
    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let op = MirrorOperation::new(ctx.clone(), Arc::new(source));

    let report = pull_to_local_fs(&op, Some(&[version("1.56.5")])).await.unwrap();
    assert_eq!(report.versions.len(), 1);
    let set = LayoutSet::open(&ctx.work_dir, SOURCE_REPO).unwrap();
    let channels = set.get(&Family::ReleaseChannels).unwrap();
    assert!(channels.find(&format!("{SOURCE_REPO}/release-channel:v1.56.5")).is_some());
    assert!(channels.find(&format!("{SOURCE_REPO}/release-channel:v1.55.7")).is_none());
}

#[tokio::test]
async fn test_suspended_channel_aborts_before_pull() {
    let registry = MemoryRegistry::new();
    let healthy = publish_version(&registry, SOURCE_REPO, "v1.56.5", false);
    let suspended = publish_version(&registry, SOURCE_REPO, "v1.55.7", true);
    for channel in CHANNELS {
        let head = if channel == "stable" { &suspended } else { &healthy };
        point_channel(&registry, head, channel);
    }

    let tmp = TempDir::new().unwrap();
    let ctx = context(&tmp);
    let op = MirrorOperation::new(ctx.clone(), Arc::new(registry));
    let err = pull_to_local_fs(&op, None).await.unwrap_err();
    match err.root() {
        MirrorError::CorruptReleaseChannel { image, reason } => {
            assert!(image.ends_with("release-channel:stable"));
            assert!(reason.contains("suspended"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!layout_root(&ctx.work_dir, SOURCE_REPO).join("blobs").exists());
}

#[tokio::test]
async fn test_min_version_floor() {
    let registry = MemoryRegistry::new();
    let mut published = std::collections::BTreeMap::new();
    for v in ["v1.56.0", "v1.57.3", "v1.58.0", "v1.58.1", "v1.59.0", "v1.59.1"] {
        published.insert(v, publish_version(&registry, SOURCE_REPO, v, false));
    }
    for (channel, v) in [
        ("alpha", "v1.59.1"),
        ("beta", "v1.59.1"),
        ("early-access", "v1.58.1"),
        ("stable", "v1.57.3"),
        ("rock-solid", "v1.56.0"),
    ] {
        point_channel(&registry, &published[v], channel);
    }

    let resolver = VersionResolver::new(&registry, SOURCE_REPO, Some(version("1.58.0")));
    let versions: Vec<_> = resolver.resolve().await.unwrap().into_iter().collect();
    assert_eq!(
        versions,
        vec![version("1.56.0"), version("1.57.3"), version("1.58.1"), version("1.59.1")]
    );
}
