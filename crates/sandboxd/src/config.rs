use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use sandbox::LanguageProfile;
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

pub(crate) const DEFAULT_TTL_SECS: u64 = 300;
pub(crate) const DEFAULT_MAX_LIFETIME_SECS: u64 = 3600;
pub(crate) const DEFAULT_MAX_SOURCE_BYTES: usize = 64 * 1024;
pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 4;
pub(crate) const DEFAULT_MAX_QUEUED: usize = 16;
pub(crate) const DEFAULT_REAPER_INTERVAL_SECS: u64 = 5;
pub(crate) const DEFAULT_RECLAIMED_RETENTION_SECS: u64 = 60;
pub(crate) const DEFAULT_AUDIT_QUEUE_SIZE: usize = 256;
pub(crate) const CONFIG_FILE_NAME: &str = "sandboxd.yaml";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_dir: PathBuf,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditConfig>,
    /// Extra profiles, or replacements for built-ins with the same id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<LanguageProfile>,
}

/// Lifecycle and capacity policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub default_ttl_secs: u64,
    pub max_lifetime_secs: u64,
    pub max_source_bytes: usize,
    pub max_concurrent: usize,
    pub max_queued: usize,
    pub reaper_interval_secs: u64,
    pub reclaimed_retention_secs: u64,
    /// Start an execution as soon as a sandbox is submitted.
    pub run_on_submit: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            max_source_bytes: DEFAULT_MAX_SOURCE_BYTES,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_queued: DEFAULT_MAX_QUEUED,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            reclaimed_retention_secs: DEFAULT_RECLAIMED_RETENTION_SECS,
            run_on_submit: false,
        }
    }
}

impl SandboxConfig {
    pub fn validate(&self) -> ServiceResult<()> {
        let invalid = |msg: String| Err(ServiceError::Config(msg));
        if self.default_ttl_secs == 0 {
            return invalid("sandbox.default_ttl_secs must be positive".into());
        }
        if self.default_ttl_secs > self.max_lifetime_secs {
            return invalid(format!(
                "sandbox.default_ttl_secs ({}) exceeds sandbox.max_lifetime_secs ({})",
                self.default_ttl_secs, self.max_lifetime_secs
            ));
        }
        // chrono durations are bounded by i64 milliseconds.
        if self.max_lifetime_secs > i64::MAX as u64 / 1000 {
            return invalid("sandbox.max_lifetime_secs is out of range".into());
        }
        if self.max_concurrent == 0 {
            return invalid("sandbox.max_concurrent must be at least 1".into());
        }
        if self.max_source_bytes == 0 {
            return invalid("sandbox.max_source_bytes must be positive".into());
        }
        if self.reaper_interval_secs == 0 {
            return invalid("sandbox.reaper_interval_secs must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Webhook receiving one JSON POST per event.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default = "default_audit_queue_size")]
    pub queue_size: usize,
}

fn default_audit_queue_size() -> usize {
    DEFAULT_AUDIT_QUEUE_SIZE
}

/// Load and validate a service config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> ServiceResult<ServiceConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ServiceError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ServiceConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ServiceError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

/// Write `config` to `<base_dir>/sandboxd.yaml` and return the file path.
pub async fn generate(config: &ServiceConfig) -> ServiceResult<PathBuf> {
    let base_dir = &config.base_dir;
    tokio::fs::create_dir_all(base_dir)
        .await
        .map_err(|e| ServiceError::Config(format!("create {}: {e}", base_dir.display())))?;

    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| ServiceError::Config(format!("serialize config: {e}")))?;

    let config_path = base_dir.join(CONFIG_FILE_NAME);
    tokio::fs::write(&config_path, content)
        .await
        .map_err(|e| ServiceError::Config(format!("write {}: {e}", config_path.display())))?;
    Ok(config_path)
}

impl ServiceConfig {
    /// Defaults for everything except the base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            listen: default_listen(),
            sandbox: SandboxConfig::default(),
            audit: None,
            languages: Vec::new(),
        }
    }

    pub fn validate(&self) -> ServiceResult<()> {
        self.sandbox.validate()?;
        if let Some(audit) = &self.audit {
            if audit.url.is_empty() {
                return Err(ServiceError::Config("audit.url must not be empty".into()));
            }
            if audit.queue_size == 0 {
                return Err(ServiceError::Config("audit.queue_size must be positive".into()));
            }
        }
        for profile in &self.languages {
            profile
                .validate()
                .map_err(|e| ServiceError::Config(format!("languages: {e}")))?;
        }
        Ok(())
    }

    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if self.base_dir.is_relative() {
            self.base_dir = config_dir.join(&self.base_dir);
        }
    }

    pub fn status_path(&self) -> PathBuf {
        self.base_dir.join("status.json")
    }
}
