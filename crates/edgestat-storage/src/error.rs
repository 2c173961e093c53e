//! Storage error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Blob storage error: {0}")]
    Blob(#[from] opendal::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A batch call carried more statements than the store accepts
    #[error("Batch of {size} statements exceeds the ceiling of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Invalid stored value in {table}.{column}: {reason}")]
    InvalidData {
        table: &'static str,
        column: &'static str,
        reason: String,
    },

    #[error("Invalid storage configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn invalid_data(table: &'static str, column: &'static str, reason: impl ToString) -> Self {
        Self::InvalidData {
            table,
            column,
            reason: reason.to_string(),
        }
    }

    /// Errors worth another attempt after a short wait.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    let message = db.message();
                    message.contains("database is locked") || message.contains("busy")
                }
                _ => false,
            },
            Self::Blob(err) => err.is_temporary(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}
