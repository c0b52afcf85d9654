//! Error types for the SenseFuse core

use std::time::Duration;
use thiserror::Error;

/// Result type alias for SenseFuse core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the SenseFuse core
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid pipeline, session, or synchronizer configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Named entity is not registered
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registration attempted under an already-taken name
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// Circuit breaker is open (too many consecutive failures)
    #[error("Circuit open for pipeline {pipeline}: retry in {cooldown_remaining:?}")]
    CircuitOpen {
        /// Pipeline whose breaker rejected the call
        pipeline: String,
        /// Time until the breaker admits a half-open probe
        cooldown_remaining: Duration,
    },

    /// Operation exceeded its latency budget
    #[error("Timeout after {timeout_ms}ms: {context}")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
        /// Additional context
        context: String,
    },

    /// No registered pipeline covers the requested capabilities
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// A distributor failed to deliver an event (isolated per channel)
    #[error("Distributor {distributor} send failed: {reason}")]
    DistributorSend {
        /// Distributor name within the session
        distributor: String,
        /// Failure reason
        reason: String,
    },

    /// Synchronization quality dropped below the configured floor (soft)
    #[error("Synchronization quality {score:.3} below floor {floor:.3}")]
    SynchronizationQuality {
        /// Observed alignment quality
        score: f64,
        /// Configured quality floor
        floor: f64,
    },

    /// Pipeline execution error
    #[error("Execution error: {0}")]
    Execution(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a timeout error with a millisecond budget
    pub fn timeout(timeout_ms: u64, context: impl Into<String>) -> Self {
        Error::Timeout {
            timeout_ms,
            context: context.into(),
        }
    }

    /// Shorthand for an execution error
    pub fn execution(msg: impl Into<String>) -> Self {
        Error::Execution(msg.into())
    }

    /// Shorthand for a channel-isolated distributor send failure
    pub fn send_failed(distributor: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::DistributorSend {
            distributor: distributor.into(),
            reason: reason.into(),
        }
    }
}
