//! Error types for the retrodiction coordinator
//!
//! This module defines the unified error type used across the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Error Categories
//!
//! - **Configuration**: invalid or missing options, detected at startup
//! - **Invariant**: a world-state or trust-shard invariant was broken
//! - **Transient I/O**: storage or remote-sink failure that may succeed on retry
//! - **Cancellation**: cooperative cancellation, not a failure
//! - **Timeout**: a batch exceeded its wall-clock cap
//! - **Rule execution**: a rule raised while a turn was being applied
//! - **Backend**: every data-store backend failed for a dataset
//!
//! Hot paths never log-and-rethrow: they record a structured diagnostic and
//! surface it to the coordinator via the result channel. Only the coordinator
//! decides what is fatal to a run.

use std::io;
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, RetrodictError>;

/// Unified error type for all retrodiction operations
#[derive(Debug, Error)]
pub enum RetrodictError {
    /// Invalid or missing configuration, detected at startup
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },

    /// A world-state or trust-shard invariant was broken
    #[error("invariant violation: {message}")]
    InvariantViolation {
        /// Which invariant and how it was violated
        message: String,
    },

    /// A variable received a non-finite value
    #[error("invalid value for {name}: {value}")]
    InvalidValue {
        /// Variable name
        name: String,
        /// The rejected value
        value: f64,
    },

    /// A capital bucket would go negative
    #[error("out of range: {name} would become {value}")]
    OutOfRange {
        /// Asset or bucket name
        name: String,
        /// The rejected resulting value
        value: f64,
    },

    /// Two registered rules write the same target in one turn
    #[error("conflicting effects on {target}: rules {first} and {second}")]
    ConflictingEffects {
        /// The variable or overlay both rules write
        target: String,
        /// First writer, by rule id
        first: String,
        /// Second writer, by rule id
        second: String,
    },

    /// Transient I/O failure, retried with bounded backoff
    #[error("transient I/O error: {message}")]
    TransientIo {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cooperative cancellation; batches finalize as cancelled
    #[error("cancelled")]
    Cancelled,

    /// A batch exceeded its wall-clock cap
    #[error("timeout after {elapsed_ms}ms")]
    Timeout {
        /// How long the batch ran before timing out
        elapsed_ms: u64,
    },

    /// A rule raised while applying a turn
    #[error("rule {rule_id} failed: {message}")]
    RuleExecution {
        /// The offending rule
        rule_id: String,
        /// Diagnostic from the rule engine
        message: String,
    },

    /// Dataset missing across all backends
    #[error("dataset not found: {dataset}")]
    NotFound {
        /// The dataset that was requested
        dataset: String,
    },

    /// Every data-store backend failed for a dataset
    #[error("all backends unavailable for {dataset}: {message}")]
    BackendUnavailable {
        /// The dataset that was requested
        dataset: String,
        /// Last backend failure
        message: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {message}")]
    Serialization {
        /// What went wrong
        message: String,
    },

    /// Data integrity check failed
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption
        message: String,
    },

    /// Rule registry mutated after being frozen for a run
    #[error("registry frozen: {message}")]
    RegistryFrozen {
        /// What mutation was attempted
        message: String,
    },

    /// Unexpected internal error, indicates a bug
    #[error("internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl RetrodictError {
    /// Create a Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        RetrodictError::Configuration {
            message: message.into(),
        }
    }

    /// Create an InvariantViolation error
    pub fn invariant(message: impl Into<String>) -> Self {
        RetrodictError::InvariantViolation {
            message: message.into(),
        }
    }

    /// Create a TransientIo error
    pub fn transient(message: impl Into<String>) -> Self {
        RetrodictError::TransientIo {
            message: message.into(),
            source: None,
        }
    }

    /// Create a TransientIo error with an underlying cause
    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        RetrodictError::TransientIo {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a RuleExecution error
    pub fn rule_execution(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        RetrodictError::RuleExecution {
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    /// Create a NotFound error
    pub fn not_found(dataset: impl Into<String>) -> Self {
        RetrodictError::NotFound {
            dataset: dataset.into(),
        }
    }

    /// Create a BackendUnavailable error
    pub fn backend_unavailable(dataset: impl Into<String>, message: impl Into<String>) -> Self {
        RetrodictError::BackendUnavailable {
            dataset: dataset.into(),
            message: message.into(),
        }
    }

    /// Create a Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        RetrodictError::Serialization {
            message: message.into(),
        }
    }

    /// Create a Corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        RetrodictError::Corruption {
            message: message.into(),
        }
    }

    /// Create an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        RetrodictError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error may succeed on retry
    ///
    /// Only transient I/O failures are retried; everything else either
    /// fails the batch or the run.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrodictError::TransientIo { .. })
    }

    /// Check if this error is a cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RetrodictError::Cancelled)
    }

    /// Check if this error fails the batch without retry
    ///
    /// Invariant violations, rule registry errors, and timeouts
    /// short-circuit to a failed batch with a diagnostic string.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            RetrodictError::InvariantViolation { .. }
                | RetrodictError::InvalidValue { .. }
                | RetrodictError::OutOfRange { .. }
                | RetrodictError::Timeout { .. }
                | RetrodictError::RuleExecution { .. }
                | RetrodictError::BackendUnavailable { .. }
                | RetrodictError::NotFound { .. }
                | RetrodictError::Corruption { .. }
        )
    }

    /// Check if this error is fatal to the whole run
    ///
    /// Configuration and registry errors are detected at startup and abort
    /// the run before any batch executes.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            RetrodictError::Configuration { .. }
                | RetrodictError::ConflictingEffects { .. }
                | RetrodictError::RegistryFrozen { .. }
                | RetrodictError::Internal { .. }
        )
    }
}

impl From<io::Error> for RetrodictError {
    fn from(e: io::Error) -> Self {
        RetrodictError::TransientIo {
            message: format!("I/O error: {}", e),
            source: Some(Box::new(e)),
        }
    }
}

impl From<serde_json::Error> for RetrodictError {
    fn from(e: serde_json::Error) -> Self {
        RetrodictError::Serialization {
            message: format!("JSON error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RetrodictError::transient("connection reset").is_retryable());
        assert!(!RetrodictError::configuration("bad window").is_retryable());
        assert!(!RetrodictError::Cancelled.is_retryable());
        assert!(!RetrodictError::Timeout { elapsed_ms: 100 }.is_retryable());
    }

    #[test]
    fn test_batch_fatal_classification() {
        assert!(RetrodictError::rule_execution("R1", "division by zero").is_fatal_for_batch());
        assert!(RetrodictError::Timeout { elapsed_ms: 100 }.is_fatal_for_batch());
        assert!(RetrodictError::not_found("prices").is_fatal_for_batch());
        assert!(!RetrodictError::transient("slow disk").is_fatal_for_batch());
        assert!(!RetrodictError::Cancelled.is_fatal_for_batch());
    }

    #[test]
    fn test_run_fatal_classification() {
        assert!(RetrodictError::configuration("max_workers = 0").is_fatal_for_run());
        let conflict = RetrodictError::ConflictingEffects {
            target: "y".to_string(),
            first: "R1".to_string(),
            second: "R2".to_string(),
        };
        assert!(conflict.is_fatal_for_run());
        assert!(!RetrodictError::transient("slow disk").is_fatal_for_run());
    }

    #[test]
    fn test_cancellation_is_not_failure() {
        let e = RetrodictError::Cancelled;
        assert!(e.is_cancellation());
        assert!(!e.is_fatal_for_batch());
        assert!(!e.is_fatal_for_run());
    }

    #[test]
    fn test_display_messages() {
        let e = RetrodictError::InvalidValue {
            name: "x".to_string(),
            value: f64::NAN,
        };
        assert!(e.to_string().contains("invalid value for x"));

        let e = RetrodictError::backend_unavailable("prices", "mmap failed");
        assert!(e.to_string().contains("prices"));
        assert!(e.to_string().contains("mmap failed"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let e: RetrodictError = io_err.into();
        assert!(e.is_retryable());
    }
}
