use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MirrorError, Result};
use crate::filter::ModuleFilter;

/// Default bundle chunk size: 512 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024 * 1024;

/// Default number of layouts pulled in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Mirror operation configuration.
///
/// Built once by the caller and treated as immutable for the duration of an
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MirrorContext {
    /// Use plain HTTP for the registry transport
    pub insecure: bool,

    /// Keep HTTPS but skip certificate verification
    #[serde(rename = "skipTLSVerify")]
    pub skip_tls_verify: bool,

    /// Do not write Stribog sidecars when packing
    pub skip_secondary_digests: bool,

    /// Registry credentials
    pub auth: RegistryAuth,

    /// Destination registry host (empty for pull-only operations)
    pub registry_host: String,

    /// Destination repository path under the host
    pub registry_path: String,

    /// Source repository, e.g. `registry.example.com/distribution/edition`
    pub source_repo: String,

    /// Bundle base path; chunks are `<bundle>.NNNN.chunk`
    pub bundle_path: Option<PathBuf>,

    /// Where the OCI layout tree is materialized
    pub work_dir: PathBuf,

    /// Layout verification depth
    pub validation_mode: ValidationMode,

    /// Floor for version selection
    pub min_version: Option<semver::Version>,

    /// Module/release restriction (empty means everything)
    pub module_filter: ModuleFilter,

    /// Bundle chunk size in bytes
    pub chunk_size: u64,

    /// Worker pool width for concurrent layout pulls
    pub concurrency: usize,

    /// Retry policy for image transfers
    pub retry: RetryConfig,

    /// Write DeckhouseRelease manifests here after a push
    pub release_manifests_path: Option<PathBuf>,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for MirrorContext {
    fn default() -> Self {
        Self {
            insecure: false,
            skip_tls_verify: false,
            skip_secondary_digests: false,
            auth: RegistryAuth::Anonymous,
            registry_host: String::new(),
            registry_path: String::new(),
            source_repo: String::new(),
            bundle_path: None,
            work_dir: std::env::temp_dir().join("d8-mirror"),
            validation_mode: ValidationMode::Fast,
            min_version: None,
            module_filter: ModuleFilter::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryConfig::default(),
            release_manifests_path: None,
            log_level: LogLevel::Info,
        }
    }
}

impl MirrorContext {
    /// Load a context from a YAML (or JSON) file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let ctx: Self = serde_yaml::from_str(&data)?;
        ctx.validate()?;
        Ok(ctx)
    }

    /// Check field combinations that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(MirrorError::Config("chunkSize must be positive".to_string()));
        }
        if self.concurrency == 0 {
            return Err(MirrorError::Config("concurrency must be positive".to_string()));
        }
        if self.source_repo.trim_matches('/').is_empty() && self.registry_host.is_empty() {
            return Err(MirrorError::Config(
                "either sourceRepo or registryHost must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Source repository without surrounding slashes.
    pub fn source_repo(&self) -> &str {
        self.source_repo.trim_matches('/')
    }

    /// Destination repository `<host>/<path>`, if a destination is configured.
    pub fn destination_repo(&self) -> Option<String> {
        let host = self.registry_host.trim_end_matches('/');
        if host.is_empty() {
            return None;
        }
        let path = self.registry_path.trim_matches('/');
        if path.is_empty() {
            Some(host.to_string())
        } else {
            Some(format!("{host}/{path}"))
        }
    }
}

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RegistryAuth {
    /// No credentials
    #[default]
    Anonymous,
    /// Username and password
    Basic { username: String, password: String },
    /// Pre-issued token
    Bearer { token: String },
}

impl RegistryAuth {
    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Basic credentials for a distribution license key.
    pub fn license_token(token: impl Into<String>) -> Self {
        Self::basic("license-token", token)
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if not set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::Basic { username, password },
            _ => Self::Anonymous,
        }
    }
}

/// How thoroughly layouts are checked before push or after pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// No checks
    Off,
    /// Manifest structure and blob presence
    #[default]
    Fast,
    /// Recompute every digest
    Full,
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Fast => write!(f, "fast"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = MirrorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "fast" => Ok(Self::Fast),
            "full" => Ok(Self::Full),
            other => Err(MirrorError::Config(format!(
                "unknown validation mode: '{}' (supported: off, fast, full)",
                other
            ))),
        }
    }
}

/// Retry policy for transient registry failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay_ms: u64,

    /// Backoff ceiling
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the ceiling.
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        std::time::Duration::from_millis(delay)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
