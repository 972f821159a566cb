//! Persisted run summary
//!
//! The stable, key-ordered layout written at the end of a run. All maps are
//! `BTreeMap` so serialization is canonical regardless of insertion order.

use crate::config::CoordinatorConfig;
use crate::types::{RunId, RunState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Batch outcome counts for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchCounts {
    /// Batches planned
    pub total: usize,
    /// Batches that finished successfully
    pub succeeded: usize,
    /// Batches that failed (after retries, timeout, or non-retryable error)
    pub failed: usize,
    /// Batches dropped or interrupted by cancellation
    pub cancelled: usize,
    /// succeeded / total; 1.0 by convention for an empty run
    pub success_rate: f64,
}

impl BatchCounts {
    /// Recompute the success rate from the counts
    pub fn finalize(&mut self) {
        self.success_rate = if self.total == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total as f64
        };
    }
}

/// Per-rule trust scores surfaced in the summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    /// Number of variables the run covered
    pub total: usize,
    /// Posterior mean per rule id
    pub trust_scores: BTreeMap<String, f64>,
    /// 95% confidence interval per rule id
    pub trust_intervals: BTreeMap<String, (f64, f64)>,
}

/// Wall-clock performance of the run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Wall seconds for the whole run
    pub wall_seconds: f64,
    /// Sum of per-batch durations (a sequential estimate)
    pub estimated_sequential_seconds: f64,
    /// estimated_sequential / wall
    pub speedup: f64,
}

/// Key-ordered run summary, the user-visible surface of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// The run this summary describes
    pub run_id: RunId,
    /// Terminal state of the run
    pub state: RunState,
    /// Resolved configuration the run executed with
    pub config: CoordinatorConfig,
    /// Batch outcome counts
    pub batches: BatchCounts,
    /// Trust results
    pub variables: VariableSummary,
    /// Timing
    pub performance: PerformanceSummary,
    /// Per-stage wall seconds recorded by the pipeline
    pub stage_seconds: BTreeMap<String, f64>,
    /// Remote location of the uploaded summary, when upload succeeded
    pub remote_uri: Option<String>,
    /// Error surfaced by a tolerated remote upload failure
    pub remote_error: Option<String>,
    /// Handle to the run's audit trail
    pub trace_ref: String,
}

impl RunSummary {
    /// Construct an empty summary for a run
    pub fn new(run_id: RunId, config: CoordinatorConfig) -> Self {
        RunSummary {
            run_id,
            state: RunState::Queued,
            config,
            batches: BatchCounts::default(),
            variables: VariableSummary::default(),
            performance: PerformanceSummary::default(),
            stage_seconds: BTreeMap::new(),
            remote_uri: None,
            remote_error: None,
            trace_ref: String::new(),
        }
    }

    /// Exit code for batch-job execution
    ///
    /// 0 success; 1 generic failure; 2 configuration invalid; 3 cancelled;
    /// 4 partial (some batches failed but the run completed).
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Completed => {
                if self.batches.failed > 0 {
                    4
                } else {
                    0
                }
            }
            RunState::Cancelled => 3,
            RunState::Failed => 1,
            RunState::Queued | RunState::Running => 1,
        }
    }
}
