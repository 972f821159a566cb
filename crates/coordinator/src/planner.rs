//! Batch planner
//!
//! Shards a (variables, date range) request into time-windowed batches.
//! Ids are deterministic hashes of the variable set and window, so planning
//! the same request twice yields identical batches. Batches come out in
//! time order; the curriculum may reweight them but never reorders within
//! a time step.

use crate::batch::TrainingBatch;
use retrodict_core::{BatchId, RetrodictError, Result, Timestamp};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

/// Planning parameters
#[derive(Debug, Clone)]
pub struct PlanRequest {
    /// Variables to replay
    pub variables: Vec<String>,
    /// Range start (inclusive), Unix seconds
    pub start: Timestamp,
    /// Range end (exclusive), Unix seconds
    pub end: Timestamp,
    /// Window width per batch, seconds
    pub window_secs: i64,
    /// Stride between window starts; equal to `window_secs` when
    /// non-overlapping
    pub step_secs: i64,
    /// Expected observation spacing, for expected row counts
    pub sample_interval_secs: i64,
}

fn batch_id(variables: &[String], start: Timestamp, end: Timestamp) -> BatchId {
    let mut sorted: Vec<&str> = variables.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let canonical = format!("{}|{}|{}", sorted.join(","), start, end);
    BatchId::from_string(format!("batch-{:016x}", xxh3_64(canonical.as_bytes())))
}

/// Split a request into time-ordered batches
///
/// Boundary behavior: an empty variable set or an empty range plans zero
/// batches. The final window is clipped to the range end.
pub fn plan(request: &PlanRequest) -> Result<Vec<TrainingBatch>> {
    if request.window_secs <= 0 {
        return Err(RetrodictError::configuration("window must be positive"));
    }
    if request.step_secs <= 0 {
        return Err(RetrodictError::configuration("step must be positive"));
    }
    if request.sample_interval_secs <= 0 {
        return Err(RetrodictError::configuration(
            "sample interval must be positive",
        ));
    }
    if request.variables.is_empty() || request.start >= request.end {
        return Ok(Vec::new());
    }

    let mut batches = Vec::new();
    let mut window_start = request.start;
    let mut planning_index = 0;
    while window_start < request.end {
        let window_end = (window_start + request.window_secs).min(request.end);
        let expected_row_count =
            ((window_end - window_start) / request.sample_interval_secs).max(1) as usize;
        batches.push(TrainingBatch {
            id: batch_id(&request.variables, window_start, window_end),
            variable_set: request.variables.clone(),
            window_start,
            window_end,
            expected_row_count,
            priority: 1.0,
            planning_index,
        });
        planning_index += 1;
        window_start += request.step_secs;
    }

    debug!(
        target: "retrodict::planner",
        batches = batches.len(),
        window = request.window_secs,
        step = request.step_secs,
        "plan produced"
    );
    Ok(batches)
}
