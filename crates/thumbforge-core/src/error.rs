//! Error types for thumbforge.

use thiserror::Error;

/// Result type alias using thumbforge's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for thumbforge operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Message broker unreachable or a queue command failed
    #[error("Queue error: {0}")]
    Queue(String),

    /// Thumbnail generation failed (decode, resize, or encode)
    #[error("Processing error: {0}")]
    Processing(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for failures of backing infrastructure (store or broker) that a
    /// caller may reasonably retry later.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Queue(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Queue(e.to_string())
    }
}
