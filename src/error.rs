//! Error types for eventbridge

use thiserror::Error;

/// Errors that can occur in the event bridge
#[derive(Debug, Error)]
pub enum EventError {
    /// Malformed inbound event; rejected before publish
    #[error("Validation failed for '{field}': {reason}")]
    Validation { field: &'static str, reason: String },

    /// The durable backend cannot be reached; publish fails fast and the
    /// producer owns the retry
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A replay request targets an offset below the trim horizon
    #[error("Offset {requested} evicted (earliest retained: {earliest})")]
    OffsetEvicted { requested: u64, earliest: u64 },

    /// Invalid rule expression at subscription registration
    #[error("Rule compile error at offset {position}: {reason}")]
    RuleCompile { reason: String, position: usize },

    /// Subscription, dead letter, or consumer not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, EventError>;
