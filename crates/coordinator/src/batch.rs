//! Training batches and per-batch results

use retrodict_core::{BatchId, BatchStatus, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Independent unit of retrodiction work over a time window
///
/// Batches never share mutable state; workers own one batch at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingBatch {
    /// Deterministic id (hash of variables + window)
    pub id: BatchId,
    /// Variables this batch replays
    pub variable_set: Vec<String>,
    /// Window start (inclusive), Unix seconds
    pub window_start: Timestamp,
    /// Window end (exclusive), Unix seconds
    pub window_end: Timestamp,
    /// Rows the planner expects the window to hold
    pub expected_row_count: usize,
    /// Curriculum weight; higher runs are preferred under contention
    pub priority: f64,
    /// Position in planning order, preserved by the audit trail
    pub planning_index: usize,
}

impl TrainingBatch {
    /// Window width in seconds
    pub fn window_secs(&self) -> i64 {
        self.window_end - self.window_start
    }
}

/// Outcome of one executed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResult {
    /// The batch this result describes
    pub batch_id: BatchId,
    /// Terminal status
    pub status: BatchStatus,
    /// Wall seconds spent executing (including retries)
    pub duration_secs: f64,
    /// Aggregated per-rule (successes, failures) observed by this batch
    ///
    /// Empty for failed or cancelled batches: trust application is
    /// all-or-nothing per batch.
    pub trust_deltas: BTreeMap<String, (u64, u64)>,
    /// Scalar measurements (rows, turns, aborts, residual magnitudes)
    pub metrics: BTreeMap<String, f64>,
    /// Diagnostic for failed batches
    pub error: Option<String>,
    /// Handle to the batch's audit trail records
    pub trace_ref: String,
}

impl TrainingResult {
    /// A result shell for a batch that never ran
    pub fn cancelled(batch_id: BatchId) -> Self {
        TrainingResult {
            batch_id,
            status: BatchStatus::Cancelled,
            duration_secs: 0.0,
            trust_deltas: BTreeMap::new(),
            metrics: BTreeMap::new(),
            error: None,
            trace_ref: String::new(),
        }
    }

    /// Whether the batch finished successfully
    pub fn succeeded(&self) -> bool {
        self.status == BatchStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_secs() {
        let batch = TrainingBatch {
            id: BatchId::from_string("b"),
            variable_set: vec!["x".to_string()],
            window_start: 100,
            window_end: 400,
            expected_row_count: 3,
            priority: 1.0,
            planning_index: 0,
        };
        assert_eq!(batch.window_secs(), 300);
    }

    #[test]
    fn test_cancelled_result_is_empty() {
        let result = TrainingResult::cancelled(BatchId::from_string("b"));
        assert!(!result.succeeded());
        assert!(result.trust_deltas.is_empty());
        assert!(result.error.is_none());
    }
}
