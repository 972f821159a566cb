//! Parallel run coordinator
//!
//! Executes a list of training batches to completion (or cancellation)
//! with bounded memory, even work distribution, and partial-failure
//! aggregation.
//!
//! ## Scheduling model
//!
//! A fixed pool of `max_workers` threads. The feeder round-robins batches
//! into per-worker queues under a single scheduling lock, blocking when
//! the total queued count reaches `queue_depth` (backpressure). Idle
//! workers steal from the back of the longest sibling queue. The
//! supervisor (the caller of `run`) owns the result aggregator, the
//! progress callback, and the run-abort gate; user callbacks never run on
//! worker threads.
//!
//! ## Per-batch lifecycle
//!
//! `pending -> in_flight -> {succeeded, failed, cancelled}`; transitions
//! are single-writer (the owning worker). Completion order is
//! non-deterministic; the aggregate is invariant to it because trust
//! updates commute and result reduction is commutative.

use crate::batch::{TrainingBatch, TrainingResult};
use crate::cancel::CancellationToken;
use crate::executor::{execute_batch, ExecutionEnv};
use crate::metrics::MetricsCollector;
use parking_lot::{Condvar, Mutex};
use retrodict_core::{
    BatchStatus, CoordinatorConfig, Result, RetrodictError, RunId, RunState,
};
use retrodict_durability::AuditTrail;
use retrodict_engine::TurnRunner;
use retrodict_storage::DataStore;
use retrodict_trust::TrustBuffer;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Progress snapshot delivered to the supervisor-side callback
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Batches finalized so far
    pub completed: usize,
    /// Batches planned in total
    pub total: usize,
    /// Batches currently owned by workers
    pub in_flight: usize,
    /// Estimated seconds until completion, once one batch has finished
    pub eta_seconds: Option<f64>,
}

/// Callback invoked on the supervisor thread only
pub type ProgressCallback = Box<dyn FnMut(ProgressUpdate) + Send>;

/// Counters describing how a run was scheduled
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorStats {
    /// Batches stolen by idle workers
    pub stolen: u64,
    /// Transient retries across all batches
    pub retries: u64,
    /// Workers in the pool
    pub workers: usize,
}

/// Aggregate outcome of a run
#[derive(Debug)]
pub struct RunReport {
    /// Terminal run state
    pub state: RunState,
    /// Per-batch results, in completion order
    pub results: Vec<TrainingResult>,
    /// Wall seconds for the whole run
    pub wall_seconds: f64,
    /// Scheduling counters
    pub stats: CoordinatorStats,
}

impl RunReport {
    /// Batch counts reduced from the results (commutative)
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut succeeded = 0;
        let mut failed = 0;
        let mut cancelled = 0;
        for result in &self.results {
            match result.status {
                BatchStatus::Succeeded => succeeded += 1,
                BatchStatus::Failed => failed += 1,
                BatchStatus::Cancelled => cancelled += 1,
                BatchStatus::Pending | BatchStatus::InFlight => {}
            }
        }
        (succeeded, failed, cancelled)
    }

    /// Sum of per-batch durations: the sequential-time estimate
    pub fn estimated_sequential_seconds(&self) -> f64 {
        self.results.iter().map(|r| r.duration_secs).sum()
    }
}

/// Shared dependencies handed to every worker
pub struct CoordinatorDeps {
    /// Shared read-only data store
    pub store: DataStore,
    /// Turn runner over the frozen rule set
    pub runner: TurnRunner,
    /// Shared write-many trust buffer
    pub buffer: Arc<TrustBuffer>,
    /// Shared write-many metrics collector
    pub metrics: Arc<MetricsCollector>,
    /// Audit trail
    pub trail: Arc<AuditTrail>,
    /// Dataset holding the observed rows
    pub dataset_id: String,
}

struct SchedState {
    locals: Vec<VecDeque<TrainingBatch>>,
    queued: usize,
    feeding_done: bool,
}

struct Shared {
    state: Mutex<SchedState>,
    work_ready: Condvar,
    space_ready: Condvar,
    results: Mutex<Vec<TrainingResult>>,
    result_ready: Condvar,
    in_flight: AtomicUsize,
    stolen: AtomicU64,
    retries: AtomicU64,
}

/// The parallel coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    deps: Arc<CoordinatorDeps>,
}

impl Coordinator {
    /// Create a coordinator over validated configuration
    pub fn new(config: CoordinatorConfig, deps: CoordinatorDeps) -> Result<Self> {
        config.validate()?;
        Ok(Coordinator {
            config,
            deps: Arc::new(deps),
        })
    }

    /// Execute batches to completion or cancellation
    ///
    /// The calling thread acts as feeder and supervisor: it blocks until
    /// every batch has finalized, invoking `progress` after each
    /// completion. Returns the aggregated report; per-batch failures never
    /// abort the run unless the success ratio falls below the configured
    /// floor after the minimum sample.
    pub fn run(
        &self,
        run_id: RunId,
        batches: Vec<TrainingBatch>,
        token: CancellationToken,
        mut progress: Option<ProgressCallback>,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let total = batches.len();
        let workers = self.config.max_workers;

        info!(
            target: "retrodict::coordinator",
            run = %run_id,
            batches = total,
            workers,
            "run starting"
        );

        if total == 0 {
            return Ok(RunReport {
                state: RunState::Completed,
                results: Vec::new(),
                wall_seconds: started.elapsed().as_secs_f64(),
                stats: CoordinatorStats {
                    workers,
                    ..CoordinatorStats::default()
                },
            });
        }

        let shared = Arc::new(Shared {
            state: Mutex::new(SchedState {
                locals: (0..workers).map(|_| VecDeque::new()).collect(),
                queued: 0,
                feeding_done: false,
            }),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
            results: Mutex::new(Vec::with_capacity(total)),
            result_ready: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            stolen: AtomicU64::new(0),
            retries: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(workers);
        for worker_index in 0..workers {
            let shared = Arc::clone(&shared);
            let deps = Arc::clone(&self.deps);
            let config = self.config.clone();
            let token = token.clone();
            let handle = std::thread::Builder::new()
                .name(format!("retrodict-worker-{}", worker_index))
                .spawn(move || {
                    worker_loop(worker_index, &shared, &deps, &config, run_id, &token);
                })
                .expect("failed to spawn coordinator worker thread");
            handles.push(handle);
        }

        // Feed with backpressure: block while the queue is at depth.
        let mut fed = 0usize;
        let mut dropped_by_cancel: Vec<TrainingBatch> = Vec::new();
        let mut pending_iter = batches.into_iter();
        for batch in pending_iter.by_ref() {
            let mut state = shared.state.lock();
            while state.queued >= self.config.queue_depth && !token.is_cancelled() {
                shared
                    .space_ready
                    .wait_for(&mut state, Duration::from_millis(50));
            }
            if token.is_cancelled() {
                drop(state);
                dropped_by_cancel.push(batch);
                break;
            }
            let slot = fed % workers;
            state.locals[slot].push_back(batch);
            state.queued += 1;
            fed += 1;
            drop(state);
            shared.work_ready.notify_all();
        }
        dropped_by_cancel.extend(pending_iter);
        {
            let mut state = shared.state.lock();
            state.feeding_done = true;
        }
        shared.work_ready.notify_all();

        // Pending batches dropped by cancellation finalize as cancelled.
        if !dropped_by_cancel.is_empty() {
            let mut results = shared.results.lock();
            for batch in dropped_by_cancel.drain(..) {
                results.push(TrainingResult::cancelled(batch.id));
            }
            shared.result_ready.notify_all();
        }

        // Supervise: aggregate results, report progress, enforce the
        // run-abort gate. Callbacks run here, never on workers.
        let mut reported = 0usize;
        let mut aborted_by_gate = false;
        loop {
            let mut results = shared.results.lock();
            while results.len() == reported && results.len() < total && !token.is_cancelled() {
                shared
                    .result_ready
                    .wait_for(&mut results, Duration::from_millis(50));
            }
            let completed = results.len();
            let (succeeded, failed, _cancelled) = count_statuses(&results);
            drop(results);

            if completed > reported {
                if let Some(cb) = progress.as_mut() {
                    let elapsed = started.elapsed().as_secs_f64();
                    cb(ProgressUpdate {
                        completed,
                        total,
                        in_flight: shared.in_flight.load(Ordering::Relaxed),
                        eta_seconds: Some(elapsed / completed as f64 * (total - completed) as f64),
                    });
                }
                reported = completed;
            }

            let sampled = succeeded + failed;
            if !aborted_by_gate
                && sampled >= self.config.min_sample_batches
                && sampled > 0
                && (succeeded as f64 / sampled as f64) < self.config.min_success_ratio
            {
                warn!(
                    target: "retrodict::coordinator",
                    run = %run_id,
                    succeeded,
                    failed,
                    "success ratio below floor, aborting run"
                );
                aborted_by_gate = true;
                token.cancel();
                shared.work_ready.notify_all();
                shared.space_ready.notify_all();
            }

            if completed >= total {
                break;
            }
            // Cancellation drain: once no worker owns a batch, everything
            // still queued finalizes as cancelled.
            if token.is_cancelled() {
                if shared.in_flight.load(Ordering::Relaxed) == 0 {
                    drain_queued_as_cancelled(&shared);
                    if shared.results.lock().len() >= total {
                        break;
                    }
                }
                // in-flight batches are finalizing; don't spin
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!(target: "retrodict::coordinator", "worker panicked");
            }
        }
        drain_queued_as_cancelled(&shared);

        let results = std::mem::take(&mut *shared.results.lock());
        let state = if aborted_by_gate {
            RunState::Failed
        } else if token.is_cancelled() {
            RunState::Cancelled
        } else {
            RunState::Completed
        };

        let report = RunReport {
            state,
            results,
            wall_seconds: started.elapsed().as_secs_f64(),
            stats: CoordinatorStats {
                stolen: shared.stolen.load(Ordering::Relaxed),
                retries: shared.retries.load(Ordering::Relaxed),
                workers,
            },
        };
        info!(
            target: "retrodict::coordinator",
            run = %run_id,
            state = %report.state,
            wall_seconds = report.wall_seconds,
            "run finished"
        );
        Ok(report)
    }

    /// Reduce results into per-rule trust deltas (commutative)
    pub fn aggregate_trust(results: &[TrainingResult]) -> BTreeMap<String, (u64, u64)> {
        let mut aggregate: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for result in results {
            for (rule, (s, f)) in &result.trust_deltas {
                let entry = aggregate.entry(rule.clone()).or_insert((0, 0));
                entry.0 += s;
                entry.1 += f;
            }
        }
        aggregate
    }
}

fn drain_queued_as_cancelled(shared: &Shared) {
    let mut state = shared.state.lock();
    let mut results = shared.results.lock();
    let mut drained = 0usize;
    for local in &mut state.locals {
        while let Some(batch) = local.pop_front() {
            drained += 1;
            results.push(TrainingResult::cancelled(batch.id));
        }
    }
    state.queued -= drained;
    drop(results);
    shared.result_ready.notify_all();
    shared.space_ready.notify_all();
}

fn count_statuses(results: &[TrainingResult]) -> (usize, usize, usize) {
    let mut succeeded = 0;
    let mut failed = 0;
    let mut cancelled = 0;
    for result in results {
        match result.status {
            BatchStatus::Succeeded => succeeded += 1,
            BatchStatus::Failed => failed += 1,
            BatchStatus::Cancelled => cancelled += 1,
            BatchStatus::Pending | BatchStatus::InFlight => {}
        }
    }
    (succeeded, failed, cancelled)
}

fn claim_batch(
    worker_index: usize,
    shared: &Shared,
    token: &CancellationToken,
) -> Option<TrainingBatch> {
    let mut state = shared.state.lock();
    loop {
        // After cancellation no batch may transition to in_flight.
        if token.is_cancelled() {
            return None;
        }
        if let Some(batch) = state.locals[worker_index].pop_front() {
            state.queued -= 1;
            shared.space_ready.notify_one();
            return Some(batch);
        }
        // Steal from the back of the longest sibling queue.
        let victim = (0..state.locals.len())
            .filter(|i| *i != worker_index)
            .max_by_key(|i| state.locals[*i].len())
            .filter(|i| !state.locals[*i].is_empty());
        if let Some(victim) = victim {
            let batch = state.locals[victim].pop_back().expect("victim non-empty");
            state.queued -= 1;
            shared.stolen.fetch_add(1, Ordering::Relaxed);
            shared.space_ready.notify_one();
            return Some(batch);
        }
        if state.feeding_done && state.queued == 0 {
            return None;
        }
        shared
            .work_ready
            .wait_for(&mut state, Duration::from_millis(50));
    }
}

fn worker_loop(
    worker_index: usize,
    shared: &Shared,
    deps: &CoordinatorDeps,
    config: &CoordinatorConfig,
    run_id: RunId,
    token: &CancellationToken,
) {
    while let Some(batch) = claim_batch(worker_index, shared, token) {
        shared.in_flight.fetch_add(1, Ordering::Relaxed);
        let result = run_with_retries(shared, deps, config, run_id, token, &batch);
        shared.in_flight.fetch_sub(1, Ordering::Relaxed);

        let mut results = shared.results.lock();
        results.push(result);
        drop(results);
        shared.result_ready.notify_all();
    }
    debug!(
        target: "retrodict::coordinator",
        worker = worker_index,
        "worker exiting"
    );
}

fn run_with_retries(
    shared: &Shared,
    deps: &CoordinatorDeps,
    config: &CoordinatorConfig,
    run_id: RunId,
    token: &CancellationToken,
    batch: &TrainingBatch,
) -> TrainingResult {
    let started = Instant::now();
    let env = ExecutionEnv {
        run_id,
        dataset_id: &deps.dataset_id,
        store: &deps.store,
        runner: &deps.runner,
        buffer: &deps.buffer,
        metrics: &deps.metrics,
        trail: &deps.trail,
        config,
        token,
    };

    let mut attempt = 0u32;
    loop {
        match execute_batch(&env, batch) {
            Ok(result) => return result,
            Err(e) if e.is_cancellation() => {
                return TrainingResult {
                    duration_secs: started.elapsed().as_secs_f64(),
                    ..TrainingResult::cancelled(batch.id.clone())
                };
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                // bounded exponential backoff on transient failures
                let delay = Duration::from_millis(config.retry_base_delay_ms)
                    * 2u32.saturating_pow(attempt);
                debug!(
                    target: "retrodict::coordinator",
                    batch = %batch.id,
                    attempt,
                    error = %e,
                    "transient failure, retrying"
                );
                shared.retries.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(delay.min(Duration::from_secs(5)));
                attempt += 1;
            }
            Err(e) => {
                let reason = match &e {
                    RetrodictError::Timeout { .. } => "timeout",
                    RetrodictError::RuleExecution { .. } => "rule_execution",
                    RetrodictError::BackendUnavailable { .. } => "backend_unavailable",
                    RetrodictError::NotFound { .. } => "not_found",
                    _ => "error",
                };
                return TrainingResult {
                    batch_id: batch.id.clone(),
                    status: BatchStatus::Failed,
                    duration_secs: started.elapsed().as_secs_f64(),
                    trust_deltas: BTreeMap::new(),
                    metrics: BTreeMap::new(),
                    error: Some(format!("{}: {}", reason, e)),
                    trace_ref: format!("{}#{}", run_id, batch.id),
                };
            }
        }
    }
}
