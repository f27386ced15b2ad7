//! Error types for the Ratewarden service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Ratewarden operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Configuration-related errors. Always fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter storage failed to answer.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Counter storage did not answer within the configured timeout.
    #[error("Storage timed out after {0:?}")]
    StorageTimeout(Duration),

    /// Redis backend errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A rule name that is not part of the active rule set.
    #[error("Unknown rate limit rule: {0}")]
    UnknownRule(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether this error came from the counter store.
    ///
    /// Storage failures are recovered by letting the request through.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            RateLimitError::Storage(_) | RateLimitError::StorageTimeout(_) | RateLimitError::Redis(_)
        )
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
