//! Error types for threat evaluation.

use thiserror::Error;

/// Errors raised while evaluating telemetry.
#[derive(Debug, Error)]
pub enum ThreatError {
    /// Telemetry that no rule can interpret (NaN features, empty path, ...)
    #[error("Invalid telemetry: {0}")]
    InvalidTelemetry(String),

    /// Audit export failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for threat operations.
pub type ThreatResult<T> = Result<T, ThreatError>;
