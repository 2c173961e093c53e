// Maintenance entrypoints shared by the admin routes, the scheduler and
// the `edgestat run` CLI command

use anyhow::Result;
use clap::ValueEnum;
use edgestat_core::time::now_ms;
use serde::Serialize;
use tracing::info;

use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    /// Regenerate the path statistics snapshot
    Snapshot,
    /// Drop snapshot versions beyond the retained count
    PruneSnapshots,
    /// Archive hot dates older than the hot window
    Archive,
    /// Evict archived dates from the hot tier
    Clean,
    /// Expire raw events and actor rollups past retention
    Retention,
}

impl MaintenanceTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceTask::Snapshot => "snapshot",
            MaintenanceTask::PruneSnapshots => "prune_snapshots",
            MaintenanceTask::Archive => "archive",
            MaintenanceTask::Clean => "clean",
            MaintenanceTask::Retention => "retention",
        }
    }
}

/// Run one maintenance task to completion and return its report as JSON.
///
/// Only infrastructure failures before any per-item work surface as
/// errors; per-date problems are part of the report.
pub async fn run_task(state: &AppState, task: MaintenanceTask) -> Result<serde_json::Value> {
    info!(task = task.as_str(), "Running maintenance task");
    let cancel = state.shutdown.child_token();
    let report = match task {
        MaintenanceTask::Snapshot => serde_json::to_value(state.publisher.regenerate().await?)?,
        MaintenanceTask::PruneSnapshots => {
            serde_json::to_value(state.publisher.prune_versions().await?)?
        }
        MaintenanceTask::Archive => {
            serde_json::to_value(state.archiver.archive_due_dates(now_ms()).await?)?
        }
        MaintenanceTask::Clean => {
            serde_json::to_value(state.cleaner.clean_archived_dates(&cancel).await?)?
        }
        MaintenanceTask::Retention => {
            serde_json::to_value(state.retention.run(now_ms(), &cancel).await?)?
        }
    };
    Ok(report)
}
