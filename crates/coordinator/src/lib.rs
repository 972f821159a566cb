//! Batch planning and parallel execution
//!
//! The orchestration layer of the retrodiction system:
//! - planner: shards a (variables, date range) request into deterministic
//!   time-windowed batches
//! - Curriculum: reweights batches by posterior uncertainty, never
//!   dropping or reordering them
//! - MetricsCollector: non-blocking metric submission with a single
//!   background drain task and load shedding
//! - Coordinator: the work-stealing worker pool with cooperative
//!   cancellation, bounded queues, per-batch retry and timeout, and
//!   commutative result aggregation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod cancel;
pub mod coordinator;
pub mod curriculum;
pub mod executor;
pub mod metrics;
pub mod planner;

pub use batch::{TrainingBatch, TrainingResult};
pub use cancel::CancellationToken;
pub use coordinator::{
    Coordinator, CoordinatorDeps, CoordinatorStats, ProgressCallback, ProgressUpdate, RunReport,
};
pub use curriculum::{Curriculum, CurriculumConfig};
pub use executor::{execute_batch, ExecutionEnv};
pub use metrics::{
    MetricErrorCallback, MetricRecord, MetricsCollector, MetricsConfig, MetricsSink,
};
pub use planner::{plan, PlanRequest};
