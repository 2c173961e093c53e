//! Snapshot publisher
//!
//! Readers get the latest published version immediately, however old it
//! is. A stale version schedules one background regeneration per
//! staleness window: an in-process flag stops concurrent readers of this
//! instance, and a TTL'd KV lock stops other instances. Without any
//! published version, readers get a degraded live computation tagged as
//! such.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use edgestat_config::SnapshotConfig;
use edgestat_core::time::{hour_bucket, now_ms, MS_PER_DAY, MS_PER_HOUR};
use edgestat_core::{DataSource, Snapshot, SnapshotMeta, SnapshotRow};
use edgestat_storage::{
    get_json, put_json, EventStore, KvStore, PathAggregateStore, PathConfigStore, Stores,
};
use metrics::{counter, histogram};
use serde::Serialize;

use crate::error::{Result, SnapshotError};
use crate::keys;
use crate::methods::{self, EnrichmentStats};

/// Read response: snapshot rows plus a truthful freshness indicator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    pub data_source: DataSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<u64>,
    pub rows: Vec<SnapshotRow>,
    /// Whether this read scheduled a background regeneration
    #[serde(skip)]
    pub refresh_triggered: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerationReport {
    pub version: u64,
    pub rows: usize,
    pub duration_ms: u64,
    pub methods_written_back: usize,
    pub write_back_conflicts: usize,
    pub write_back_failures: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub kept: Vec<u64>,
    pub deleted: Vec<u64>,
    pub duration_ms: u64,
}

#[derive(Clone)]
pub struct SnapshotPublisher {
    kv: Arc<dyn KvStore>,
    paths: PathAggregateStore,
    events: EventStore,
    path_configs: PathConfigStore,
    config: Arc<SnapshotConfig>,
    regenerating: Arc<AtomicBool>,
    instance_id: Arc<str>,
}

impl SnapshotPublisher {
    pub fn new(stores: &Stores, config: SnapshotConfig) -> Self {
        Self {
            kv: Arc::clone(&stores.kv),
            paths: stores.paths.clone(),
            events: stores.events.clone(),
            path_configs: stores.path_configs.clone(),
            config: Arc::new(config),
            regenerating: Arc::new(AtomicBool::new(false)),
            instance_id: Arc::from(uuid::Uuid::new_v4().to_string()),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Current snapshot, or a live computation when none is published or
    /// the published one cannot be read.
    ///
    /// Never waits for regeneration. Only a failing live computation is
    /// returned as an error.
    pub async fn read_current(&self) -> Result<SnapshotResponse> {
        let latest = match self.latest().await {
            Ok(latest) => latest,
            Err(e) => {
                counter!("edgestat.snapshot.read_errors").increment(1);
                tracing::warn!(error = %e, "Published snapshot unreadable, serving live data");
                None
            }
        };
        match latest {
            Some(snapshot) if !snapshot.rows.is_empty() => {
                let now = now_ms();
                let age_ms = snapshot.age_ms(now);
                let stale = age_ms >= duration_ms(self.config.stale_after());
                let refresh_triggered = stale && self.trigger_stale_refresh().await;
                counter!("edgestat.snapshot.reads", "source" => "snapshot").increment(1);
                Ok(SnapshotResponse {
                    data_source: DataSource::Snapshot,
                    version: Some(snapshot.meta.version),
                    age_seconds: Some(u64::try_from(age_ms / 1000).unwrap_or(0)),
                    rows: snapshot.rows,
                    refresh_triggered,
                })
            }
            _ => {
                counter!("edgestat.snapshot.reads", "source" => "live").increment(1);
                Ok(SnapshotResponse {
                    data_source: DataSource::Live,
                    version: None,
                    age_seconds: None,
                    rows: self.live_rows().await?,
                    refresh_triggered: false,
                })
            }
        }
    }

    /// The snapshot the `latest` pointer refers to, if its body still exists.
    pub async fn latest(&self) -> Result<Option<Snapshot>> {
        let Some(version) = self.latest_version().await? else {
            return Ok(None);
        };
        Ok(get_json(self.kv.as_ref(), &keys::body(version)).await?)
    }

    pub async fn latest_version(&self) -> Result<Option<u64>> {
        match self.kv.get(keys::LATEST).await? {
            Some(raw) => raw
                .parse()
                .map(Some)
                .map_err(|_| SnapshotError::InvalidPointer {
                    key: keys::LATEST.to_string(),
                    value: raw,
                }),
            None => Ok(None),
        }
    }

    /// Build and publish a new version.
    #[tracing::instrument(name = "snapshot.regenerate", skip(self))]
    pub async fn regenerate(&self) -> Result<RegenerationReport> {
        let start = Instant::now();
        let now = now_ms();
        let range_start = self.window_start(now);

        let mut rows = self.top_rows(range_start).await?;
        let lookback = now - i64::try_from(self.config.method_lookback_days).unwrap_or(0) * MS_PER_DAY;
        let enrichment: EnrichmentStats = methods::enrich(
            &mut rows,
            &self.events,
            &self.path_configs,
            lookback,
            &self.config.default_method_placeholder,
        )
        .await?;

        let version = u64::try_from(self.kv.increment(keys::VERSION_SEQ, 1).await?).unwrap_or(0);
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                version,
                generated_at: now,
                row_count: rows.len(),
                range_start,
                range_end: now,
            },
            rows,
        };
        self.publish(&snapshot).await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        counter!("edgestat.snapshot.generated").increment(1);
        histogram!("edgestat.snapshot.duration_ms").record(duration_ms as f64);
        tracing::info!(
            version,
            rows = snapshot.meta.row_count,
            duration_ms,
            written_back = enrichment.written_back,
            conflicts = enrichment.conflicts,
            "Snapshot published"
        );

        Ok(RegenerationReport {
            version,
            rows: snapshot.meta.row_count,
            duration_ms,
            methods_written_back: enrichment.written_back,
            write_back_conflicts: enrichment.conflicts,
            write_back_failures: enrichment.failures,
        })
    }

    /// Body first, then metadata, then the pointer, so the pointer never
    /// names a version without a body. A slower concurrent regeneration
    /// never moves the pointer backwards.
    async fn publish(&self, snapshot: &Snapshot) -> Result<()> {
        let version = snapshot.meta.version;
        let ttl = self.config.ttl();
        put_json(self.kv.as_ref(), &keys::body(version), snapshot, ttl).await?;
        put_json(self.kv.as_ref(), &keys::meta(version), &snapshot.meta, ttl).await?;

        let version = i64::try_from(version).map_err(|_| SnapshotError::InvalidPointer {
            key: keys::LATEST.to_string(),
            value: version.to_string(),
        })?;
        if !self.kv.advance(keys::LATEST, version).await? {
            tracing::debug!(version, "Newer snapshot already published, pointer kept");
        }
        Ok(())
    }

    /// Delete versions older than the newest `retain_versions`.
    ///
    /// The version the pointer names is always kept.
    #[tracing::instrument(name = "snapshot.prune", skip(self))]
    pub async fn prune_versions(&self) -> Result<PruneReport> {
        let start = Instant::now();
        let latest = self.latest_version().await?;

        let mut versions: Vec<u64> = self
            .kv
            .list_prefix(keys::body_prefix())
            .await?
            .iter()
            .filter_map(|key| keys::parse_body_version(key))
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));

        let retain = usize::try_from(self.config.retain_versions.max(1)).unwrap_or(usize::MAX);
        let mut report = PruneReport::default();
        for (rank, version) in versions.into_iter().enumerate() {
            if rank < retain || Some(version) == latest {
                report.kept.push(version);
                continue;
            }
            self.kv.delete(&keys::body(version)).await?;
            self.kv.delete(&keys::meta(version)).await?;
            report.deleted.push(version);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        if !report.deleted.is_empty() {
            tracing::info!(deleted = report.deleted.len(), kept = report.kept.len(), "Pruned snapshot versions");
        }
        Ok(report)
    }

    /// Count one completed batch and schedule a regeneration every
    /// `every_n` batches. Returns whether one was scheduled.
    pub async fn record_batch(&self, every_n: u64) -> Result<bool> {
        let count = self.kv.increment(keys::BATCH_COUNTER, 1).await?;
        let every_n = i64::try_from(every_n.max(1)).unwrap_or(i64::MAX);
        if count % every_n != 0 {
            return Ok(false);
        }
        tracing::debug!(batches = count, "Batch threshold reached, regenerating snapshot");
        Ok(self.spawn_regeneration("batch_counter"))
    }

    /// Claim the refresh for this staleness window and schedule it.
    async fn trigger_stale_refresh(&self) -> bool {
        if self.regenerating.load(Ordering::Acquire) {
            return false;
        }

        let lock_ttl = Some(self.config.stale_after());
        match self
            .kv
            .put_if_absent(keys::REGEN_LOCK, self.instance_id.to_string(), lock_ttl)
            .await
        {
            Ok(true) => self.spawn_regeneration("stale_read"),
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Could not claim snapshot refresh lock");
                false
            }
        }
    }

    /// Run `regenerate` in the background unless one is already running
    /// in this process.
    fn spawn_regeneration(&self, reason: &'static str) -> bool {
        if self
            .regenerating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let publisher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.regenerate().await {
                counter!("edgestat.snapshot.failures").increment(1);
                tracing::warn!(reason, error = %e, "Background snapshot regeneration failed");
            }
            publisher.regenerating.store(false, Ordering::Release);
        });
        tracing::debug!(reason, "Snapshot regeneration scheduled");
        true
    }

    /// Whether a background regeneration is running in this process.
    pub fn is_regenerating(&self) -> bool {
        self.regenerating.load(Ordering::Acquire)
    }

    async fn live_rows(&self) -> Result<Vec<SnapshotRow>> {
        let mut rows = self.top_rows(self.window_start(now_ms())).await?;
        methods::apply_configured(&mut rows, &self.path_configs).await?;
        Ok(rows)
    }

    async fn top_rows(&self, range_start: i64) -> Result<Vec<SnapshotRow>> {
        let stats = self.paths.top_paths(range_start, self.config.top_n).await?;
        Ok(stats.iter().map(SnapshotRow::from_stats).collect())
    }

    fn window_start(&self, now: i64) -> i64 {
        let hours = i64::try_from(self.config.window_hours).unwrap_or(0);
        hour_bucket(now - hours * MS_PER_HOUR)
    }
}

fn duration_ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
