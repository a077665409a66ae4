//! Error types for the rate limiting engine.

use thiserror::Error;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Invalid or inconsistent construction parameters
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The storage backend could not be reached during initialization
    #[error("Connection error: {0}")]
    Connection(String),

    /// A storage operation failed after the backend was connected
    #[error("Backend operation error: {0}")]
    BackendOperation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RateLimitError {
    fn from(error: config::ConfigError) -> Self {
        RateLimitError::Configuration(error.to_string())
    }
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
