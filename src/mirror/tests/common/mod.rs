//! Registry fixtures shared by the integration tests.

#![allow(dead_code)]

use d8_mirror::image::build_image;
use d8_mirror::image_set::SECURITY_DATABASES;
use d8_mirror::registry::MemoryRegistry;
use d8_mirror::CHANNELS;

pub const SOURCE_REPO: &str = "registry.example.com/deckhouse/ee";

/// Store an image, tagged or not, and return its manifest digest.
pub fn put(registry: &MemoryRegistry, repo: &str, tag: Option<&str>, files: &[(&str, &[u8])]) -> String {
    let image = build_image(files).unwrap();
    registry.put_built(repo, tag, &image);
    image.manifest.digest
}

/// What publishing one distribution version stored.
pub struct Published {
    /// Component image digests, untagged in the distribution repository
    pub alpine: String,
    pub bashible_apiserver: String,
    /// Bundled module image named by the distribution image
    pub cilium_agent: String,
    /// `(repository, manifest digest)` of the tagged platform images
    pub tagged: Vec<(String, String)>,
}

/// Publish one distribution version on the three platform repositories.
pub fn publish_version(registry: &MemoryRegistry, repo: &str, version: &str, suspend: bool) -> Published {
    let alpine = put(registry, repo, None, &[("etc/alpine-release", format!("alpine{version}").as_bytes())]);
    let bashible_apiserver = put(
        registry,
        repo,
        None,
        &[("usr/bin/bashible-apiserver", format!("bashibleApiserver{version}").as_bytes())],
    );

    let digests = serde_json::json!({
        "common": {"alpine": alpine},
        "nodeManager": {"bashibleApiserver": bashible_apiserver},
    })
    .to_string();
    let install = format!("{repo}/install");
    let installer = put(
        registry,
        &install,
        Some(version),
        &[
            ("deckhouse/candi/images_digests.json", digests.as_bytes()),
            ("deckhouse/candi/version", version.as_bytes()),
        ],
    );

    let version_json = format!(r#"{{"version":"{version}","suspend":{suspend},"requirements":{{"k8s":"1.26"}}}}"#);
    let changelog = format!("candi:\n  fixes:\n  - summary: fixes for {version}\n");
    let channels = format!("{repo}/release-channel");
    let release = put(
        registry,
        &channels,
        Some(version),
        &[
            ("version.json", version_json.as_bytes()),
            ("changelog.yaml", changelog.as_bytes()),
        ],
    );

    let cilium_agent = put(registry, repo, None, &[("usr/bin/cilium-agent", format!("cilium{version}").as_bytes())]);
    let module_images = serde_json::json!({"cniCilium": {"agent": cilium_agent}}).to_string();
    let distribution = put(
        registry,
        repo,
        Some(version),
        &[
            ("deckhouse/version", version.as_bytes()),
            ("deckhouse/modules/images_digests.json", module_images.as_bytes()),
        ],
    );

    Published {
        alpine,
        bashible_apiserver,
        cilium_agent,
        tagged: vec![
            (repo.to_string(), distribution),
            (install, installer),
            (channels, release),
        ],
    }
}

/// Point `channel` at a published version on every platform repository.
pub fn point_channel(registry: &MemoryRegistry, published: &Published, channel: &str) {
    for (repository, digest) in &published.tagged {
        registry.tag(repository, channel, digest);
    }
}

/// Publish every security database under `<repo>/security`.
pub fn publish_security_databases(registry: &MemoryRegistry, repo: &str) {
    for (name, tag) in SECURITY_DATABASES {
        put(registry, &format!("{repo}/security/{name}"), Some(tag), &[("db/metadata.json", name.as_bytes())]);
    }
}

/// The two-version source of the end-to-end pull scenario.
///
/// alpha and beta follow v1.56.5; the other channels follow v1.55.7.
pub fn two_version_source() -> (MemoryRegistry, Vec<Published>) {
    let registry = MemoryRegistry::new();
    let old = publish_version(&registry, SOURCE_REPO, "v1.55.7", false);
    let new = publish_version(&registry, SOURCE_REPO, "v1.56.5", false);
    for channel in CHANNELS {
        let head = if matches!(channel, "alpha" | "beta") { &new } else { &old };
        point_channel(&registry, head, channel);
    }
    publish_security_databases(&registry, SOURCE_REPO);
    (registry, vec![old, new])
}
