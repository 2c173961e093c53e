//! Error types for event validation

use thiserror::Error;

/// Reasons a traffic event is rejected before aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// A required field is absent or empty
    #[error("event is missing required field '{0}'")]
    MissingField(&'static str),

    /// The event body could not be decoded
    #[error("malformed event payload: {0}")]
    Malformed(String),

    /// The timestamp cannot be represented as a UTC date
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(i64),
}

/// Result type alias for EventError
pub type Result<T> = std::result::Result<T, EventError>;
