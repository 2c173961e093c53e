//! Pipeline error types

use edgestat_snapshot::SnapshotError;
use edgestat_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backpressure: the in-process queue is at capacity
    #[error("Queue is full ({capacity} messages buffered)")]
    QueueFull { capacity: usize },

    #[error("Queue is closed")]
    QueueClosed,
}
