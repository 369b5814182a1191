//! Error types for the relay.

use thiserror::Error;

/// Relay error type.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Outbox database error
    #[error("Database error: {0}")]
    Database(#[from] outbox_database::DatabaseError),

    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP client construction or request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (listener bind, signal setup)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected shape of a stream reply or entry
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether the error comes from the change stream connection.
    pub fn is_stream_error(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::Protocol(_))
    }
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;
