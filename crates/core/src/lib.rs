//! Core types for the retrodiction training coordinator
//!
//! This crate defines the foundational types used throughout the system:
//! - RunId / BatchId / RuleId / SimId: identifiers
//! - RunState / BatchStatus: lifecycle enums
//! - RetrodictError: the unified error taxonomy
//! - CoordinatorConfig: the full configuration surface with env overrides
//! - RunSummary: the stable, key-ordered persisted summary

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod summary;
pub mod types;

pub use config::{CoordinatorConfig, DecayPhase, MetricsDropPolicy};
pub use error::{RetrodictError, Result};
pub use summary::{BatchCounts, PerformanceSummary, RunSummary, VariableSummary};
pub use types::{
    now_millis, now_seconds, BatchId, BatchStatus, RuleId, RunId, RunState, SimId, Timestamp,
};
