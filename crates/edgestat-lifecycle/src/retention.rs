//! Retention sweeps
//!
//! Unconditional expiry of raw events and actor rollups past their
//! retention, plus cleanup of stage bookkeeping. Path rollups are never
//! touched.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use edgestat_config::LifecycleConfig;
use edgestat_core::time::{cutoff_date, MS_PER_DAY};
use edgestat_storage::{ActorStore, EventStore, PendingAggregations, Stores};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::report::RetentionReport;

#[derive(Clone)]
pub struct RetentionSweeper {
    events: EventStore,
    actors: ActorStore,
    pending: PendingAggregations,
    config: Arc<LifecycleConfig>,
}

impl RetentionSweeper {
    pub fn new(stores: &Stores, config: LifecycleConfig) -> Self {
        Self {
            events: stores.events.clone(),
            actors: stores.actors.clone(),
            pending: stores.pending.clone(),
            config: Arc::new(config),
        }
    }

    /// Run every sweep once.
    #[tracing::instrument(name = "lifecycle.retention", skip(self, cancel))]
    pub async fn run(&self, now_ms: i64, cancel: &CancellationToken) -> Result<RetentionReport> {
        let start = Instant::now();
        let mut report = RetentionReport::default();

        let (raw_cutoff, raw_deleted, raw_complete) = self.expire_raw_events(now_ms, cancel).await?;
        report.raw_cutoff = raw_cutoff;
        report.raw_events_deleted = raw_deleted;
        report.raw_complete = raw_complete;

        let (actor_cutoff, details, days, actor_complete) =
            self.purge_actor_stats(now_ms, cancel).await?;
        report.actor_cutoff = actor_cutoff;
        report.actor_details_deleted = details;
        report.actor_days_deleted = days;
        report.actor_complete = actor_complete;

        report.pending_cleared = self.pending.clear_completed().await?;
        let horizon = i64::from(self.config.hot_window_days.max(1)) * MS_PER_DAY;
        report.pending_expired = self.pending.expire(now_ms - horizon).await?;

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            raw_deleted = report.raw_events_deleted,
            actor_days = report.actor_days_deleted,
            actor_details = report.actor_details_deleted,
            pending_expired = report.pending_expired,
            duration_ms = report.duration_ms,
            "Retention sweep complete"
        );
        Ok(report)
    }

    /// Delete raw events older than `raw_retention_days`, whatever their
    /// archive status. Returns the cutoff date, rows deleted and whether
    /// the sweep drained everything eligible.
    pub async fn expire_raw_events(
        &self,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<(String, u64, bool)> {
        let cutoff = cutoff_date(now_ms, self.config.raw_retention_days)?;
        let (deleted, complete) = self
            .drain(cancel, || self.events.delete_batch_before(&cutoff, self.config.delete_batch_size))
            .await?;
        counter!("edgestat.retention.raw_deleted").increment(deleted);
        Ok((cutoff, deleted, complete))
    }

    /// Delete actor detail and summary rows older than
    /// `actor_retention_days`. Returns the cutoff, detail rows deleted,
    /// summary rows deleted and whether both drained.
    pub async fn purge_actor_stats(
        &self,
        now_ms: i64,
        cancel: &CancellationToken,
    ) -> Result<(String, u64, u64, bool)> {
        let cutoff = cutoff_date(now_ms, self.config.actor_retention_days)?;
        let batch = self.config.delete_batch_size;
        let (details, details_complete) = self
            .drain(cancel, || self.actors.purge_details_before(&cutoff, batch))
            .await?;
        let (days, days_complete) = self
            .drain(cancel, || self.actors.purge_days_before(&cutoff, batch))
            .await?;
        counter!("edgestat.retention.actor_deleted").increment(details + days);
        Ok((cutoff, details, days, details_complete && days_complete))
    }

    /// Repeat a bounded delete until it comes back short, the iteration cap
    /// is hit, or the sweep is cancelled.
    async fn drain<F, Fut>(&self, cancel: &CancellationToken, mut delete: F) -> Result<(u64, bool)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = edgestat_storage::Result<u64>>,
    {
        let batch = self.config.delete_batch_size as u64;
        let mut deleted = 0;
        for _ in 0..self.config.max_delete_iterations {
            if cancel.is_cancelled() {
                return Ok((deleted, false));
            }
            let removed = delete().await?;
            deleted += removed;
            if removed < batch {
                return Ok((deleted, true));
            }
        }
        Ok((deleted, false))
    }
}
