//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the service runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;
use warden_model::PermissionBits;

use crate::logging::LogFormat;

fn default_consumer_group() -> String {
    "warden".to_owned()
}

fn default_partitions() -> u32 {
    1
}

fn default_topic_refresh_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_sync_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_sync_age_limit() -> Duration {
    Duration::from_secs(60)
}

fn default_retry_step() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_budget() -> Duration {
    Duration::from_secs(600)
}

fn default_completion_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_admin_role() -> String {
    "admin".to_owned()
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object for the Warden runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub topics: IndexMap<String, TopicSeed>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "WARDEN_CONFIG";

    /// Load configuration from disk, respecting the `WARDEN_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.sync.validate()?;
        for (topic_id, seed) in &self.topics {
            seed.validate(topic_id)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Consumer group used by topics that do not name their own.
    #[serde(default = "default_consumer_group")]
    pub default_consumer_group: String,
    /// Partition count used when a topic asks for provisioning without a count.
    #[serde(default = "default_partitions")]
    pub default_partitions: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_consumer_group: default_consumer_group(),
            default_partitions: default_partitions(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_consumer_group.trim().is_empty() {
            return Err(anyhow!("transport.default_consumer_group must not be empty"));
        }
        if self.default_partitions == 0 {
            return Err(anyhow!("transport.default_partitions must be positive"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_topic_refresh_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub topic_refresh_interval: Duration,
    #[serde(default = "default_sync_check_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sync_check_interval: Duration,
    /// Minimum age of an unsynced write before the watchdog republishes it.
    #[serde(default = "default_sync_age_limit")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub sync_age_limit: Duration,
    /// Linear backoff unit; attempt `n` waits `n * retry_step`.
    #[serde(default = "default_retry_step")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_step: Duration,
    #[serde(default = "default_retry_budget")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_budget: Duration,
    #[serde(default = "default_completion_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub completion_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topic_refresh_interval: default_topic_refresh_interval(),
            sync_check_interval: default_sync_check_interval(),
            sync_age_limit: default_sync_age_limit(),
            retry_step: default_retry_step(),
            retry_budget: default_retry_budget(),
            completion_timeout: default_completion_timeout(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("sync.topic_refresh_interval", self.topic_refresh_interval),
            ("sync.sync_check_interval", self.sync_check_interval),
            ("sync.retry_step", self.retry_step),
            ("sync.completion_timeout", self.completion_timeout),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_call_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub storage: Duration,
    #[serde(default = "default_call_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub publish: Duration,
    #[serde(default = "default_call_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub identity: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            storage: default_call_timeout(),
            publish: default_call_timeout(),
            identity: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Base URL of the identity service answering role membership lookups.
    #[serde(default)]
    pub role_members_url: Option<String>,
    /// Role name that marks a caller as system administrator.
    #[serde(default = "default_admin_role")]
    pub admin_role: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            role_members_url: None,
            admin_role: default_admin_role(),
        }
    }
}

/// Topic declared in configuration and seeded into storage when missing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicSeed {
    #[serde(default)]
    pub event_topic_name: Option<String>,
    #[serde(default)]
    pub consumer_group: Option<String>,
    #[serde(default)]
    pub no_transport: bool,
    #[serde(default)]
    pub ensure_transport_init: bool,
    #[serde(default)]
    pub partition_count: Option<u32>,
    #[serde(default)]
    pub disabled_consumer: bool,
    #[serde(default)]
    pub default_permissions: SeedPermissions,
}

/// Default permissions in their compact `rwxa` text form, keyed by principal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedPermissions {
    #[serde(default)]
    pub users: IndexMap<String, String>,
    #[serde(default)]
    pub groups: IndexMap<String, String>,
    #[serde(default)]
    pub roles: IndexMap<String, String>,
}

impl TopicSeed {
    pub fn validate(&self, topic_id: &str) -> Result<()> {
        if topic_id.trim().is_empty() {
            return Err(anyhow!("topic ids must not be empty"));
        }
        if matches!(self.partition_count, Some(0)) {
            return Err(anyhow!(
                "topic '{}' partition_count must be positive",
                topic_id
            ));
        }
        let entries = self
            .default_permissions
            .users
            .iter()
            .chain(&self.default_permissions.groups)
            .chain(&self.default_permissions.roles);
        for (principal, bits) in entries {
            bits.parse::<PermissionBits>().map_err(|err| {
                anyhow!(
                    "topic '{}' has malformed default permission '{}' for '{}': {}",
                    topic_id,
                    bits,
                    principal,
                    err
                )
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}
