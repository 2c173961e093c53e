//! Snapshot publisher errors

use edgestat_core::EventError;
use edgestat_storage::StorageError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Time error: {0}")]
    Time(#[from] EventError),

    #[error("Snapshot pointer {key} holds an invalid version: {value}")]
    InvalidPointer { key: String, value: String },
}
