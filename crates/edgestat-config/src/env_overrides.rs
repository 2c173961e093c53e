use super::{FsConfig, KvBackend, LogFormat, RuntimeConfig, S3Config, StorageBackend};
use anyhow::{anyhow, Context, Result};
use std::str::FromStr;

pub const ENV_PREFIX: &str = "EDGESTAT_";

/// Abstraction over environment-variable lookups so tests can supply their
/// own source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the EDGESTAT_ prefix
    /// Used for AWS standard variables (AWS_REGION, AWS_ENDPOINT_URL)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Server configuration (listen addr, log level/format)
    if let Some(addr) = env.get("LISTEN_ADDR") {
        config.server.listen_addr = addr;
    }
    if let Some(level) = env.get("LOG_LEVEL") {
        config.server.log_level = level;
    }
    if let Some(format) = env.get("LOG_FORMAT") {
        config.server.log_format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    if let Some(val) = parse_env(env, "MAX_PAYLOAD_BYTES")? {
        config.request.max_payload_bytes = val;
    }

    // Database
    if let Some(url) = env.get("DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(val) = parse_env(env, "DATABASE_MAX_CONNECTIONS")? {
        config.database.max_connections = val;
    }
    if let Some(val) = parse_env(env, "MAX_BATCH_STATEMENTS")? {
        config.database.max_batch_statements = val;
    }

    // Blob storage
    if let Some(backend) = env.get("STORAGE_BACKEND") {
        config.storage.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid EDGESTAT_STORAGE_BACKEND value")?;
    }
    if let Some(path) = env.get("STORAGE_PATH") {
        config.storage.fs.get_or_insert_with(FsConfig::default).path = path;
    }
    if let Some(bucket) = env.get("S3_BUCKET") {
        ensure_s3(config).bucket = bucket;
    }
    if let Some(region) = env.get("S3_REGION").or_else(|| env.get_raw("AWS_REGION")) {
        ensure_s3(config).region = region;
    }
    if let Some(endpoint) = env
        .get("S3_ENDPOINT")
        .or_else(|| env.get_raw("AWS_ENDPOINT_URL"))
    {
        ensure_s3(config).endpoint = Some(endpoint);
    }
    if let Some(prefix) = env.get("STORAGE_PREFIX") {
        config.storage.prefix = normalize_prefix(prefix);
    }

    if let Some(backend) = env.get("KV_BACKEND") {
        config.kv.backend = backend
            .parse::<KvBackend>()
            .context("Invalid EDGESTAT_KV_BACKEND value")?;
    }

    // Queue
    if let Some(val) = parse_env(env, "QUEUE_CAPACITY")? {
        config.queue.capacity = val;
    }
    if let Some(val) = parse_env(env, "QUEUE_MAX_BATCH_SIZE")? {
        config.queue.max_batch_size = val;
    }
    if let Some(val) = parse_env(env, "QUEUE_MAX_BATCH_WAIT_MS")? {
        config.queue.max_batch_wait_ms = val;
    }
    if let Some(val) = parse_env(env, "QUEUE_MAX_RETRIES")? {
        config.queue.max_retries = val;
    }

    // Aggregation and snapshots
    if let Some(val) = parse_env(env, "RESERVOIR_CAPACITY")? {
        config.aggregation.reservoir_capacity = val;
    }
    if let Some(val) = parse_env(env, "SNAPSHOT_EVERY_N_BATCHES")? {
        config.aggregation.snapshot_every_n_batches = val;
    }
    if let Some(val) = parse_env(env, "SNAPSHOT_TOP_N")? {
        config.snapshot.top_n = val;
    }
    if let Some(val) = parse_env(env, "SNAPSHOT_WINDOW_HOURS")? {
        config.snapshot.window_hours = val;
    }
    if let Some(val) = parse_env(env, "SNAPSHOT_STALE_AFTER_SECS")? {
        config.snapshot.stale_after_secs = val;
    }
    if let Some(val) = parse_env(env, "SNAPSHOT_RETAIN_VERSIONS")? {
        config.snapshot.retain_versions = val;
    }

    // Lifecycle
    if let Some(val) = parse_env(env, "HOT_WINDOW_DAYS")? {
        config.lifecycle.hot_window_days = val;
    }
    if let Some(val) = parse_env(env, "ARCHIVE_PAGE_SIZE")? {
        config.lifecycle.page_size = val;
    }
    if let Some(val) = parse_env(env, "DELETE_BATCH_SIZE")? {
        config.lifecycle.delete_batch_size = val;
    }
    if let Some(val) = parse_env(env, "RAW_RETENTION_DAYS")? {
        config.lifecycle.raw_retention_days = val;
    }
    if let Some(val) = parse_env(env, "ACTOR_RETENTION_DAYS")? {
        config.lifecycle.actor_retention_days = val;
    }

    Ok(())
}

fn ensure_s3(config: &mut RuntimeConfig) -> &mut S3Config {
    config.storage.s3.get_or_insert_with(S3Config::default)
}

fn parse_env<E, T>(env: &E, key: &str) -> Result<Option<T>>
where
    E: EnvSource,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn normalize_prefix(prefix: String) -> Option<String> {
    if prefix.is_empty() {
        None
    } else if prefix.ends_with('/') {
        Some(prefix)
    } else {
        Some(format!("{}/", prefix))
    }
}
