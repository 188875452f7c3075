//! Error types for the Abuseguard service.

use thiserror::Error;

/// Main error type for Abuseguard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised while layering configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Distributed backend errors
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A backend call did not complete in time
    #[error("{backend} did not respond within {after_ms}ms")]
    Timeout { backend: &'static str, after_ms: u64 },

    /// Record (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Abuseguard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
