//! Core identifier and status types
//!
//! This module defines the foundational types used throughout the system:
//! - RunId: unique identifier for a training run
//! - BatchId: deterministic identifier for a training batch
//! - RuleId: identifier for a causal rule
//! - SimId: opaque per-run simulation identifier
//! - RunState / BatchStatus: lifecycle enums
//! - Timestamp helpers

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unix timestamp in seconds
pub type Timestamp = i64;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Get current wall-clock time in seconds as a float
pub fn now_seconds() -> f64 {
    now_millis() as f64 / 1000.0
}

/// Unique identifier for a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Generate a fresh run id
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        RunId(Uuid::new_v4())
    }

    /// Parse a run id from its string form
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(RunId)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Deterministic identifier for a training batch
///
/// Derived from the batch's variable set and time window so that planning
/// the same range twice yields the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    /// Wrap a precomputed id string
    pub fn from_string(s: impl Into<String>) -> Self {
        BatchId(s.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier for a causal rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(String);

impl RuleId {
    /// Create a rule id
    pub fn new(s: impl Into<String>) -> Self {
        RuleId(s.into())
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        RuleId(s.to_string())
    }
}

/// Opaque simulation identifier, unique per run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimId(String);

impl SimId {
    /// Create a sim id from an explicit string
    pub fn new(s: impl Into<String>) -> Self {
        SimId(s.into())
    }

    /// Generate a fresh sim id
    pub fn generate() -> Self {
        SimId(format!("sim-{}", Uuid::new_v4()))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Submitted but not yet started
    Queued,
    /// Batches are executing
    Running,
    /// All batches finished (some may have failed)
    Completed,
    /// The run aborted below the success-ratio floor or on a fatal error
    Failed,
    /// The run was cancelled cooperatively
    Cancelled,
}

impl RunState {
    /// Whether the run has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Queued | RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a single batch
///
/// Transitions are single-writer (the owning worker):
/// `Pending -> InFlight -> {Succeeded, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Planned, waiting in a queue
    Pending,
    /// Claimed by a worker
    InFlight,
    /// Completed successfully
    Succeeded,
    /// Failed (after retries, on timeout, or on a non-retryable error)
    Failed,
    /// Dropped or interrupted by cancellation
    Cancelled,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::InFlight => "in_flight",
            BatchStatus::Succeeded => "succeeded",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
