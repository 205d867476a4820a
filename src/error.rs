//! # Error Types
//!
//! Custom error types for the telemetry relay using `thiserror`.
//!
//! Only [`RelayError::Protocol`] ever reaches a subscriber. Source, breaker
//! and timeout failures are absorbed by substituting cached or default
//! telemetry.

use thiserror::Error;

/// Main error type for the telemetry relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Connecting to the telemetry source failed after exhausting retries
    #[error("Telemetry source unavailable at {address} after {attempts} attempts")]
    SourceUnavailable { address: String, attempts: u32 },

    /// A guarded operation was rejected without being attempted
    #[error("Circuit breaker {name} is OPEN - service unavailable")]
    BreakerOpen { name: String },

    /// A field or snapshot read exceeded its time bound
    #[error("Telemetry read timed out: {0}")]
    ReadTimeout(String),

    /// The source stopped sending heartbeats
    #[error("Stale heartbeat: last heartbeat {age_s:.1}s ago")]
    StaleHeartbeat { age_s: f64 },

    /// A snapshot failed the freshness/completeness check
    #[error("Snapshot validation failed: {0}")]
    ValidationFailed(String),

    /// Malformed subscriber request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Errors reported by the telemetry source collaborator
    #[error("Telemetry source error: {0}")]
    Source(String),

    /// A shared structure's lock was poisoned by a panicking holder
    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// A blocking worker panicked or was cancelled
    #[error("Worker error: {0}")]
    Worker(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio::task::JoinError> for RelayError {
    fn from(err: tokio::task::JoinError) -> Self {
        RelayError::Worker(err.to_string())
    }
}

/// Result type alias for the telemetry relay
pub type Result<T> = std::result::Result<T, RelayError>;
