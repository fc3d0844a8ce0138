//! Core error types

use thiserror::Error;

/// Core error type for SwarmLink
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input that could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
