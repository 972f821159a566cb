//! Parallel retrodiction training coordinator
//!
//! Replays historical time-series observations in overlapping
//! time-windowed batches, runs a deterministic causal-rule simulation
//! against each window, updates per-rule Bayesian trust from the
//! residuals, and emits training metrics, with bounded memory and
//! throughput proportional to available CPU.
//!
//! ## Crate map
//!
//! - [`retrodict_core`]: ids, error taxonomy, configuration, run summary
//! - [`retrodict_engine`]: world state, causal rules, turn runner
//! - [`retrodict_trust`]: sharded Beta posteriors and the update buffer
//! - [`retrodict_storage`]: the streaming columnar data store
//! - [`retrodict_durability`]: audit trail and results persistence
//! - [`retrodict_coordinator`]: planner, curriculum, metrics, worker pool
//! - this crate: the staged training pipeline and the service facade
//!
//! ## Quick start
//!
//! ```ignore
//! use retrodict::{PipelinePaths, RunRequest, TrainingPipeline, TrainingService};
//! use retrodict::engine::{Rule, RuleRegistry, Trigger, Effect};
//!
//! let mut registry = RuleRegistry::new();
//! registry.register(Rule::new(
//!     "R1",
//!     Trigger::VariableAbove { name: "x".into(), threshold: 10.0 },
//!     vec![Effect::AdjustVariable { name: "y".into(), delta: 1.0 }],
//! ))?;
//! let rules = registry.freeze()?;
//!
//! let pipeline = TrainingPipeline::new(rules, PipelinePaths::under("/var/lib/retrodict"));
//! let service = TrainingService::new(std::sync::Arc::new(pipeline));
//! let run_id = service.submit_run(request)?;
//! let summary = { service.wait(run_id)?; service.results(run_id)? };
//! std::process::exit(summary.exit_code());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pipeline;
pub mod service;

pub use pipeline::{PipelinePaths, RemoteData, RunRequest, TrainingPipeline};
pub use service::{EventStream, RunEvent, RunStatus, TrainingService};

pub use retrodict_core::{
    BatchCounts, BatchId, BatchStatus, CoordinatorConfig, DecayPhase, MetricsDropPolicy,
    PerformanceSummary, RetrodictError, Result, RuleId, RunId, RunState, RunSummary, SimId,
    Timestamp, VariableSummary,
};

/// Simulation engine re-exports
pub mod engine {
    pub use retrodict_engine::*;
}

/// Trust tracking re-exports
pub mod trust {
    pub use retrodict_trust::*;
}

/// Data store re-exports
pub mod storage {
    pub use retrodict_storage::*;
}

/// Durability re-exports
pub mod durability {
    pub use retrodict_durability::*;
}

/// Coordination re-exports
pub mod coordinator {
    pub use retrodict_coordinator::*;
}
