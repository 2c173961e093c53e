//! Structured results of scheduler-invoked lifecycle stages

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStatus {
    Archived,
    /// Already archived; nothing to do
    Skipped,
    Evicted,
    /// Refused before any deletion (no completed archive, late rows)
    Rejected,
    /// Stopped part way; rows remain and the date is not marked evicted
    Incomplete,
    Failed,
}

/// Outcome for one date within a stage run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateOutcome {
    pub date: String,
    pub status: DateStatus,
    pub records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl DateOutcome {
    pub fn new(date: &str, status: DateStatus, records: u64, duration_ms: u64) -> Self {
        Self {
            date: date.to_string(),
            status,
            records,
            compressed_bytes: None,
            error: None,
            duration_ms,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Result of one run of the archive or clean stage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: &'static str,
    pub dates: Vec<DateOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

impl StageReport {
    pub(crate) fn new(stage: &'static str) -> Self {
        Self {
            stage,
            dates: Vec::new(),
            succeeded: 0,
            failed: 0,
            duration_ms: 0,
        }
    }

    pub(crate) fn push(&mut self, outcome: DateOutcome) {
        match outcome.status {
            DateStatus::Archived | DateStatus::Evicted => self.succeeded += 1,
            DateStatus::Skipped => {}
            DateStatus::Rejected | DateStatus::Incomplete | DateStatus::Failed => self.failed += 1,
        }
        self.dates.push(outcome);
    }
}

/// Result of one retention sweep.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionReport {
    pub raw_cutoff: String,
    pub raw_events_deleted: u64,
    /// False when the sweep stopped at its iteration cap with rows left
    pub raw_complete: bool,
    pub actor_cutoff: String,
    pub actor_days_deleted: u64,
    pub actor_details_deleted: u64,
    pub actor_complete: bool,
    pub pending_cleared: u64,
    pub pending_expired: u64,
    pub duration_ms: u64,
}
