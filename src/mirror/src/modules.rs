//! Module discovery and module source descriptors.

use std::collections::BTreeMap;
use std::path::Path;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use d8_mirror_core::config::RegistryAuth;
use d8_mirror_core::error::{MirrorError, Result};
use d8_mirror_core::filter::ModuleFilter;
use serde::Deserialize;

use crate::image_set::Module;
use crate::registry::Registry;

/// Standard alphabet, padding optional. Docker configs show up both ways.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Modules published under `modules_repo` that pass `filter`.
///
/// Module names are the tags of `modules_repo`; each module's releases are
/// the tags of `<modules_repo>/<name>/release`. A missing repository means
/// there is nothing to mirror.
pub async fn discover_modules(
    registry: &dyn Registry,
    modules_repo: &str,
    filter: &ModuleFilter,
) -> Result<Vec<Module>> {
    let names = list_tags_or_empty(registry, modules_repo).await?;
    let mut modules = Vec::new();
    for name in names {
        if !filter.is_empty() && filter.tags(&name).is_none() {
            tracing::debug!(module = %name, "Module not in filter, skipping");
            continue;
        }
        let registry_path = format!("{}/{}", modules_repo, name);
        let releases = list_tags_or_empty(registry, &format!("{}/release", registry_path)).await?;
        if !filter.matches(&name, &releases) {
            tracing::info!(module = %name, "No filtered releases published, skipping module");
            continue;
        }
        modules.push(Module {
            name,
            registry_path,
            releases,
        });
    }
    tracing::info!(repository = %modules_repo, modules = modules.len(), "Discovered modules");
    Ok(modules)
}

async fn list_tags_or_empty(registry: &dyn Registry, repository: &str) -> Result<Vec<String>> {
    match registry.list_tags(repository).await {
        Ok(tags) => Ok(tags),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Where add-on modules are mirrored from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSourceDescriptor {
    /// Repository whose tags are module names
    pub registry: String,
    /// Base64 docker config JSON with credentials for `registry`
    #[serde(default)]
    pub docker_cfg: String,
    /// Module filter expression
    #[serde(default)]
    pub filter: String,
}

impl ModuleSourceDescriptor {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&data)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let descriptor: Self = serde_yaml::from_str(data)?;
        if descriptor.registry().is_empty() {
            return Err(MirrorError::Config(
                "module source registry must be set".to_string(),
            ));
        }
        Ok(descriptor)
    }

    /// Registry repository without surrounding slashes.
    pub fn registry(&self) -> &str {
        self.registry.trim_matches('/')
    }

    pub fn filter(&self) -> ModuleFilter {
        ModuleFilter::parse(&self.filter)
    }

    /// Credentials for the registry host, anonymous without a docker config.
    pub fn auth(&self) -> Result<RegistryAuth> {
        if self.docker_cfg.trim().is_empty() {
            return Ok(RegistryAuth::Anonymous);
        }
        DockerConfig::decode(&self.docker_cfg)?.credentials_for(self.registry())
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerConfig {
    fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|e| MirrorError::Config(format!("dockerCfg is not base64: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| MirrorError::Config(format!("dockerCfg is not a docker config: {}", e)))
    }

    /// Match on `host[:port]`; the path part of both sides is ignored.
    fn credentials_for(&self, repository: &str) -> Result<RegistryAuth> {
        let host = registry_host(repository);
        let (_, entry) = self
            .auths
            .iter()
            .find(|(key, _)| registry_host(key) == host)
            .ok_or_else(|| {
                MirrorError::Config(format!("dockerCfg has no credentials for {}", host))
            })?;

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(RegistryAuth::basic(username, password));
        }
        let auth = entry.auth.as_deref().ok_or_else(|| {
            MirrorError::Config(format!("dockerCfg entry for {} has no auth", host))
        })?;
        let decoded = BASE64
            .decode(auth.trim())
            .map_err(|e| MirrorError::Config(format!("dockerCfg auth is not base64: {}", e)))?;
        let decoded = String::from_utf8_lossy(&decoded);
        let (username, password) = decoded.trim_end().split_once(':').ok_or_else(|| {
            MirrorError::Config(format!("dockerCfg auth for {} is not user:password", host))
        })?;
        Ok(RegistryAuth::basic(username, password))
    }
}

fn registry_host(repository: &str) -> &str {
    let repository = repository
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    repository.split('/').next().unwrap_or(repository)
}
