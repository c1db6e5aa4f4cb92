//! Error types for Floodgate.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Misconfiguration: unknown algorithm, non-positive window/limit, etc.
    /// These are fatal at the point of use and are never defaulted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The call was refused by a rate limit or duplicate-submission lock.
    /// This is an expected outcome, not a system failure.
    #[error("Admission denied: {message}")]
    Denied {
        message: String,
        retry_after: Option<u64>,
    },

    /// Shared store errors surfaced by administrative operations
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Layered settings errors (file + environment)
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Returns `true` if this error is an admission denial.
    pub fn is_denied(&self) -> bool {
        matches!(self, FloodgateError::Denied { .. })
    }

    /// The retry hint carried by a denial, if any.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            FloodgateError::Denied { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Errors raised while talking to the shared store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis/Dragonfly protocol or connection errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer within the configured bound
    #[error("Store call timed out after {0}ms")]
    Timeout(u64),

    /// A script received arguments or state it could not interpret
    #[error("Script '{script}' failed: {reason}")]
    Script { script: &'static str, reason: String },

    /// A key holds a value of a different type than the script expects
    #[error("Key '{0}' holds a value of the wrong type")]
    WrongType(String),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
