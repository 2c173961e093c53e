//! Read-optimized snapshot model

use serde::{Deserialize, Serialize};

use crate::stats::{compute_percentiles, PathHourStats};

/// Where a read response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    /// Served from a published snapshot
    Snapshot,
    /// Computed directly over the aggregate store
    Live,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::Live => "live",
        }
    }
}

/// One path in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub requests: u64,
    pub errors: u64,
    pub error_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p50_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p99_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ms: Option<f64>,
    /// Lower bound on distinct actors
    pub unique_actors_min: u64,
}

impl SnapshotRow {
    /// Build a row from summed counters and a representative sample.
    ///
    /// `stats` carries the summed counters of every bucket for the path and
    /// the sample arrays of a single representative bucket.
    pub fn from_stats(stats: &PathHourStats) -> Self {
        let percentiles = compute_percentiles(&stats.response_samples);
        Self {
            path: stats.path.clone(),
            method: None,
            requests: stats.requests,
            errors: stats.errors,
            error_rate: stats.error_rate(),
            avg_ms: stats
                .mean_response_ms()
                .or_else(|| percentiles.map(|p| p.avg)),
            p50_ms: percentiles.map(|p| p.p50),
            p95_ms: percentiles.map(|p| p.p95),
            p99_ms: percentiles.map(|p| p.p99),
            min_ms: percentiles.map(|p| p.min),
            max_ms: percentiles.map(|p| p.max),
            unique_actors_min: stats.unique_actors_seen,
        }
    }
}

/// Metadata stored alongside each published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub version: u64,
    pub generated_at: i64,
    pub row_count: usize,
    pub range_start: i64,
    pub range_end: i64,
}

/// A published, immutable snapshot version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(flatten)]
    pub meta: SnapshotMeta,
    pub rows: Vec<SnapshotRow>,
}

impl Snapshot {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.meta.generated_at).max(0)
    }
}
