//! Cleaner: evicts archived dates from the hot tier
//!
//! A date is only touched when its archive record is completed and not yet
//! evicted. Rows are deleted in bounded batches until a batch comes back
//! short; the loop has a hard iteration cap and checks for cancellation
//! between batches. The record is marked evicted only once no rows remain.

use std::sync::Arc;
use std::time::Instant;

use edgestat_config::LifecycleConfig;
use edgestat_storage::{ArchiveRecordStore, EventStore, Stores};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::error::{LifecycleError, Result};
use crate::report::{DateOutcome, DateStatus, StageReport};

#[derive(Clone)]
pub struct Cleaner {
    events: EventStore,
    archives: ArchiveRecordStore,
    config: Arc<LifecycleConfig>,
}

impl Cleaner {
    pub fn new(stores: &Stores, config: LifecycleConfig) -> Self {
        Self {
            events: stores.events.clone(),
            archives: stores.archives.clone(),
            config: Arc::new(config),
        }
    }

    /// Evict every date with a completed, unevicted archive.
    #[tracing::instrument(name = "lifecycle.clean", skip_all)]
    pub async fn clean_archived_dates(&self, cancel: &CancellationToken) -> Result<StageReport> {
        let start = Instant::now();
        let dates = self.archives.evictable_dates().await?;

        let mut report = StageReport::new("clean");
        for date in dates {
            if cancel.is_cancelled() {
                break;
            }
            let date_start = Instant::now();
            let outcome = match self.clean_date(&date, cancel).await {
                Ok(deleted) => DateOutcome::new(
                    &date,
                    DateStatus::Evicted,
                    deleted,
                    date_start.elapsed().as_millis() as u64,
                ),
                Err(e) => {
                    let status = match &e {
                        LifecycleError::NotEvictable { .. } | LifecycleError::LateArrivals { .. } => {
                            DateStatus::Rejected
                        }
                        LifecycleError::IterationCapExceeded { .. } | LifecycleError::Cancelled { .. } => {
                            DateStatus::Incomplete
                        }
                        _ => DateStatus::Failed,
                    };
                    tracing::warn!(date = %date, error = %e, "Eviction did not complete");
                    DateOutcome::new(&date, status, 0, date_start.elapsed().as_millis() as u64)
                        .with_error(e)
                }
            };
            report.push(outcome);
        }
        report.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            evicted = report.succeeded,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Clean run complete"
        );
        Ok(report)
    }

    /// Delete one date's hot rows and mark it evicted. Returns the rows
    /// deleted.
    ///
    /// Rejects dates without a completed, unevicted archive, and dates
    /// holding more rows than were archived (those are reset to failed so
    /// the next archive run re-archives the whole date). Errors when the
    /// iteration cap is reached with rows left or when cancelled; in both
    /// cases the date stays unevicted.
    pub async fn clean_date(&self, date: &str, cancel: &CancellationToken) -> Result<u64> {
        let record = self.archives.get(date).await?;
        let record = match record {
            Some(record) if record.is_evictable() => record,
            other => {
                return Err(LifecycleError::NotEvictable {
                    date: date.to_string(),
                    status: other.as_ref().map(|r| r.status),
                    evicted: other.is_some_and(|r| r.evicted),
                })
            }
        };

        let hot = self.events.count_for_date(date).await?;
        if hot > record.record_count {
            let err = LifecycleError::LateArrivals {
                date: date.to_string(),
                hot,
                archived: record.record_count,
            };
            self.archives.mark_failed(date, &err.to_string()).await?;
            return Err(err);
        }

        let batch_size = self.config.delete_batch_size;
        let mut deleted = 0u64;
        let mut drained = false;
        let mut iterations = 0;
        while iterations < self.config.max_delete_iterations {
            if cancel.is_cancelled() {
                return Err(LifecycleError::Cancelled {
                    date: date.to_string(),
                    deleted,
                });
            }
            let removed = self.events.delete_batch_for_date(date, batch_size).await?;
            iterations += 1;
            deleted += removed;
            if removed < batch_size as u64 {
                drained = true;
                break;
            }
        }

        if !drained {
            let remaining = self.events.count_for_date(date).await?;
            if remaining > 0 {
                counter!("edgestat.clean.incomplete").increment(1);
                return Err(LifecycleError::IterationCapExceeded {
                    date: date.to_string(),
                    iterations,
                    remaining,
                });
            }
        }

        if !self.archives.mark_evicted(date).await? {
            tracing::debug!(date, "Date was marked evicted concurrently");
        }
        counter!("edgestat.clean.rows").increment(deleted);
        tracing::info!(date, deleted, iterations, "Date evicted from hot tier");
        Ok(deleted)
    }
}
