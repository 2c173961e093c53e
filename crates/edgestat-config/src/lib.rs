// edgestat-config - Runtime configuration for the edgestat service
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from EDGESTAT_CONFIG env var
// 3. Config file contents from EDGESTAT_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.edgestat.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    pub request: RequestConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub kv: KvConfig,
    pub queue: QueueConfig,
    pub aggregation: AggregationConfig,
    pub snapshot: SnapshotConfig,
    pub lifecycle: LifecycleConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8787".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Request handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub max_payload_bytes: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Relational store holding raw events, aggregates and bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Statements accepted by a single batch call
    pub max_batch_statements: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./edgestat.db".to_string(),
            max_connections: 4,
            max_batch_statements: 10,
        }
    }
}

/// Blob storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,

    /// Key prefix applied to every blob, normalized to end with '/'
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            fs: Some(FsConfig::default()),
            s3: None,
            prefix: None,
        }
    }
}

impl StorageConfig {
    /// The blob prefix, or an empty string.
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "s3" | "aws" => Ok(StorageBackend::S3),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            _ => anyhow::bail!(
                "Unsupported storage backend: {}. Supported: fs, s3, memory",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Key-value store for snapshot bodies, pointers and counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub backend: KvBackend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    /// Table in the relational store, shared across instances
    #[default]
    Sqlite,
    /// Process-local, for tests and single-node runs
    Memory,
}

impl std::str::FromStr for KvBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" | "database" => Ok(KvBackend::Sqlite),
            "memory" | "mem" => Ok(KvBackend::Memory),
            _ => anyhow::bail!("Unsupported kv backend: {}. Supported: sqlite, memory", s),
        }
    }
}

/// In-process delivery queue feeding the batch orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub max_batch_size: usize,
    pub max_batch_wait_ms: u64,
    /// Redeliveries before a message is dead-lettered
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_batch_size: 100,
            max_batch_wait_ms: 1_000,
            max_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub reservoir_capacity: usize,
    /// Every Nth processed batch triggers snapshot regeneration
    pub snapshot_every_n_batches: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            reservoir_capacity: 1000,
            snapshot_every_n_batches: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub top_n: usize,
    pub window_hours: u64,
    pub stale_after_secs: u64,
    pub retain_versions: u64,
    pub method_lookback_days: u64,
    /// Path-config method value that may be replaced by an observed method
    pub default_method_placeholder: String,
    /// Expiry of versioned snapshot bodies; 0 keeps them until pruned
    pub ttl_secs: u64,
    pub prune_interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            top_n: 100,
            window_hours: 24,
            stale_after_secs: 600,
            retain_versions: 5,
            method_lookback_days: 30,
            default_method_placeholder: "GET".to_string(),
            ttl_secs: 0,
            prune_interval_secs: 3600,
        }
    }
}

impl SnapshotConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Raw partitions younger than this stay hot
    pub hot_window_days: u32,
    pub page_size: usize,
    pub delete_batch_size: usize,
    pub max_delete_iterations: usize,
    pub raw_retention_days: u32,
    pub actor_retention_days: u32,
    pub archive_interval_secs: u64,
    pub clean_interval_secs: u64,
    pub retention_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            hot_window_days: 3,
            page_size: 5000,
            delete_batch_size: 1000,
            max_delete_iterations: 1000,
            raw_retention_days: 90,
            actor_retention_days: 30,
            archive_interval_secs: 3600,
            clean_interval_secs: 3600,
            retention_interval_secs: 86_400,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration from a specific file path (for CLI usage).
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Parse inline TOML, apply overrides from `env` and validate.
    pub fn load_with_env<E: EnvSource>(inline_config: Option<&str>, env: &E) -> Result<Self> {
        let mut config = match inline_config {
            Some(inline) => Self::from_toml(inline)?,
            None => Self::default(),
        };
        config.apply_env_overrides_from(env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config content")
    }

    /// Apply environment overrides from a custom source.
    pub fn apply_env_overrides_from<E: EnvSource>(&mut self, env: &E) -> Result<()> {
        env_overrides::apply_env_overrides(self, env)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("fs".parse::<StorageBackend>().unwrap(), StorageBackend::Fs);
        assert_eq!("s3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!(
            "memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            "filesystem".parse::<StorageBackend>().unwrap(),
            StorageBackend::Fs
        );
        assert!("r2".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_default_configs() {
        let config = RuntimeConfig::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8787");
        assert_eq!(config.server.log_format, LogFormat::Text);
        assert_eq!(config.database.max_batch_statements, 10);
        assert_eq!(config.aggregation.reservoir_capacity, 1000);
        assert_eq!(config.aggregation.snapshot_every_n_batches, 10);
        assert_eq!(config.snapshot.stale_after_secs, 600);
        assert_eq!(config.lifecycle.hot_window_days, 3);
        assert_eq!(config.lifecycle.page_size, 5000);
        assert_eq!(config.lifecycle.delete_batch_size, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml(
            r#"
            [snapshot]
            top_n = 25

            [storage]
            backend = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.snapshot.top_n, 25);
        assert_eq!(config.snapshot.stale_after_secs, 600);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.queue.max_batch_size, 100);
    }
}
