// Configuration validation
//
// Validates that required fields are present and values are sensible

use crate::*;
use anyhow::{anyhow, bail, Result};
use tracing::warn;

/// Smallest statement ceiling that still fits a summary upsert, a detail
/// upsert, the trailing refresh and the stage marker of one actor unit in
/// a single batch.
const MIN_BATCH_STATEMENTS: usize = 4;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_server_config(&config.server)?;
    validate_request_config(&config.request)?;
    validate_database_config(&config.database)?;
    validate_storage_config(&config.storage)?;
    validate_queue_config(&config.queue)?;
    validate_aggregation_config(&config.aggregation)?;
    validate_snapshot_config(&config.snapshot)?;
    validate_lifecycle_config(&config.lifecycle)?;
    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.listen_addr.is_empty() {
        bail!("server.listen_addr must not be empty");
    }

    // Basic validation that it looks like an address
    if !config.listen_addr.contains(':') {
        bail!("server.listen_addr must be in format 'host:port'");
    }

    Ok(())
}

fn validate_request_config(config: &RequestConfig) -> Result<()> {
    if config.max_payload_bytes == 0 {
        bail!("request.max_payload_bytes must be greater than 0");
    }

    if config.max_payload_bytes > 100 * 1024 * 1024 {
        warn!(
            max_payload_bytes = config.max_payload_bytes,
            "request.max_payload_bytes is very large; may cause issues"
        );
    }

    Ok(())
}

fn validate_database_config(config: &DatabaseConfig) -> Result<()> {
    if config.url.is_empty() {
        bail!("database.url must not be empty");
    }
    if config.max_connections == 0 {
        bail!("database.max_connections must be greater than 0");
    }
    if config.max_batch_statements < MIN_BATCH_STATEMENTS {
        bail!(
            "database.max_batch_statements must be at least {}",
            MIN_BATCH_STATEMENTS
        );
    }
    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<()> {
    match config.backend {
        StorageBackend::Fs => {
            let fs = config
                .fs
                .as_ref()
                .ok_or_else(|| anyhow!("fs storage backend requires 'fs' configuration"))?;

            if fs.path.is_empty() {
                bail!("storage.fs.path must not be empty");
            }
        }
        StorageBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| anyhow!("s3 storage backend requires 's3' configuration"))?;

            if s3.bucket.is_empty() {
                bail!("storage.s3.bucket is required for S3 backend");
            }

            if s3.region.is_empty() {
                bail!("storage.s3.region is required for S3 backend");
            }
        }
        StorageBackend::Memory => {
            warn!("storage.backend = memory; archives and dead letters are lost on restart");
        }
    }

    Ok(())
}

fn validate_queue_config(config: &QueueConfig) -> Result<()> {
    if config.capacity == 0 {
        bail!("queue.capacity must be greater than 0");
    }
    if config.max_batch_size == 0 {
        bail!("queue.max_batch_size must be greater than 0");
    }
    if config.max_batch_wait_ms == 0 {
        bail!("queue.max_batch_wait_ms must be greater than 0");
    }
    if config.max_batch_size > config.capacity {
        bail!("queue.max_batch_size must not exceed queue.capacity");
    }
    Ok(())
}

fn validate_aggregation_config(config: &AggregationConfig) -> Result<()> {
    if config.reservoir_capacity == 0 {
        bail!("aggregation.reservoir_capacity must be greater than 0");
    }
    if config.snapshot_every_n_batches == 0 {
        bail!("aggregation.snapshot_every_n_batches must be greater than 0");
    }

    if config.reservoir_capacity > 100_000 {
        warn!(
            reservoir_capacity = config.reservoir_capacity,
            "aggregation.reservoir_capacity is very large; bucket rows will be big"
        );
    }

    Ok(())
}

fn validate_snapshot_config(config: &SnapshotConfig) -> Result<()> {
    if config.top_n == 0 {
        bail!("snapshot.top_n must be greater than 0");
    }
    if config.window_hours == 0 {
        bail!("snapshot.window_hours must be greater than 0");
    }
    if config.stale_after_secs == 0 {
        bail!("snapshot.stale_after_secs must be greater than 0");
    }
    if config.retain_versions == 0 {
        bail!("snapshot.retain_versions must be greater than 0");
    }
    if config.ttl_secs > 0 && config.ttl_secs < config.stale_after_secs {
        warn!(
            ttl_secs = config.ttl_secs,
            stale_after_secs = config.stale_after_secs,
            "snapshot.ttl_secs is shorter than the staleness threshold; readers may fall back to live data"
        );
    }
    Ok(())
}

fn validate_lifecycle_config(config: &LifecycleConfig) -> Result<()> {
    if config.page_size == 0 {
        bail!("lifecycle.page_size must be greater than 0");
    }
    if config.delete_batch_size == 0 {
        bail!("lifecycle.delete_batch_size must be greater than 0");
    }
    if config.max_delete_iterations == 0 {
        bail!("lifecycle.max_delete_iterations must be greater than 0");
    }
    if config.raw_retention_days > 0 && config.raw_retention_days <= config.hot_window_days {
        warn!(
            raw_retention_days = config.raw_retention_days,
            hot_window_days = config.hot_window_days,
            "lifecycle.raw_retention_days expires raw rows before they can be archived"
        );
    }
    if config.page_size > 100_000 {
        warn!(
            page_size = config.page_size,
            "lifecycle.page_size is very large; archive pages are held in memory"
        );
    }
    Ok(())
}
