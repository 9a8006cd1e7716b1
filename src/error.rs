//! Error types for Floodgate.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// A policy rejection is never an error: limiters report it through their
/// boolean return value. Errors are reserved for the limiter itself failing.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Counter store failures not originating from Redis
    #[error("Store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for FloodgateError {
    fn from(err: config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
