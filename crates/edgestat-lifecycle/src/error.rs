//! Lifecycle errors

use edgestat_core::{ArchiveStatus, EventError};
use edgestat_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Blob storage error: {0}")]
    Blob(#[from] opendal::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Time error: {0}")]
    Time(#[from] EventError),

    /// Eviction requested for a date without a completed, unevicted archive
    #[error("Date {date} is not evictable (archive status: {})", describe(.status, .evicted))]
    NotEvictable {
        date: String,
        status: Option<ArchiveStatus>,
        evicted: bool,
    },

    /// Rows for the date were written after its archive was taken
    #[error("Date {date} has {hot} hot rows but only {archived} were archived")]
    LateArrivals { date: String, hot: u64, archived: u64 },

    #[error("Eviction of {date} stopped after {iterations} batches with {remaining} rows left")]
    IterationCapExceeded {
        date: String,
        iterations: usize,
        remaining: u64,
    },

    #[error("Eviction of {date} cancelled after {deleted} rows")]
    Cancelled { date: String, deleted: u64 },

    #[error("No archive for {0}")]
    ArchiveMissing(String),

    #[error("Archive for {date} does not match its recorded hash")]
    HashMismatch { date: String },
}

fn describe(status: &Option<ArchiveStatus>, evicted: &bool) -> String {
    match status {
        None => "none".to_string(),
        Some(status) if *evicted => format!("{}, evicted", status),
        Some(status) => status.to_string(),
    }
}
