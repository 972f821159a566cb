//! Training service facade
//!
//! Transport-neutral embedding of the coordinator API: submit runs, poll
//! status, cancel, fetch results, and stream progress events. An HTTP or
//! RPC layer maps straight onto these operations; none is assumed here.

use crate::pipeline::{RunRequest, TrainingPipeline};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use retrodict_core::{Result, RetrodictError, RunId, RunState, RunSummary};
use retrodict_coordinator::{CancellationToken, ProgressUpdate};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One progress event in a run's stream
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    /// Batches finalized so far
    pub completed: usize,
    /// Batches planned
    pub total: usize,
    /// Batches currently in flight
    pub in_flight: usize,
    /// Estimated seconds to completion
    pub eta_seconds: Option<f64>,
    /// Run state at event time
    pub state: RunState,
}

/// Point-in-time run status
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatus {
    /// Current state
    pub state: RunState,
    /// Completion fraction in [0, 1]
    pub progress: f64,
    /// Batches currently in flight
    pub in_flight: usize,
    /// Estimated seconds to completion
    pub eta_seconds: Option<f64>,
}

struct RunShared {
    state: Mutex<RunState>,
    latest: Mutex<Option<ProgressUpdate>>,
    events: Mutex<Vec<RunEvent>>,
    event_ready: Condvar,
    summary: Mutex<Option<RunSummary>>,
    token: CancellationToken,
}

struct RunHandle {
    shared: Arc<RunShared>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// Embedded coordinator service
///
/// Owns a registry of runs; each submission executes the pipeline on its
/// own supervisor thread.
pub struct TrainingService {
    pipeline: Arc<TrainingPipeline>,
    runs: DashMap<RunId, Arc<RunHandle>>,
}

impl TrainingService {
    /// Create a service over a pipeline
    pub fn new(pipeline: Arc<TrainingPipeline>) -> Self {
        TrainingService {
            pipeline,
            runs: DashMap::new(),
        }
    }

    /// Submit a run; returns immediately with its id
    pub fn submit_run(&self, request: RunRequest) -> Result<RunId> {
        request.config.validate()?;
        let run_id = RunId::new();
        let token = CancellationToken::new();
        let shared = Arc::new(RunShared {
            state: Mutex::new(RunState::Queued),
            latest: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            event_ready: Condvar::new(),
            summary: Mutex::new(None),
            token: token.clone(),
        });

        let pipeline = Arc::clone(&self.pipeline);
        let thread_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name(format!("retrodict-run-{}", run_id))
            .spawn(move || {
                *thread_shared.state.lock() = RunState::Running;
                let progress_shared = Arc::clone(&thread_shared);
                let progress: retrodict_coordinator::ProgressCallback =
                    Box::new(move |update: ProgressUpdate| {
                        *progress_shared.latest.lock() = Some(update.clone());
                        let mut events = progress_shared.events.lock();
                        events.push(RunEvent {
                            completed: update.completed,
                            total: update.total,
                            in_flight: update.in_flight,
                            eta_seconds: update.eta_seconds,
                            state: RunState::Running,
                        });
                        drop(events);
                        progress_shared.event_ready.notify_all();
                    });

                let outcome = pipeline.run_with_id(run_id, request, token, Some(progress));
                let final_state = match &outcome {
                    Ok(summary) => summary.state,
                    Err(e) if e.is_cancellation() => RunState::Cancelled,
                    Err(_) => RunState::Failed,
                };
                match outcome {
                    Ok(summary) => {
                        *thread_shared.summary.lock() = Some(summary);
                    }
                    Err(e) => {
                        warn!(target: "retrodict::service", run = %run_id, error = %e, "run failed");
                    }
                }

                // terminal event closes the stream; it must be visible
                // before the state flips so streams never miss it
                let latest = thread_shared.latest.lock().clone();
                let mut events = thread_shared.events.lock();
                events.push(RunEvent {
                    completed: latest.as_ref().map(|u| u.completed).unwrap_or(0),
                    total: latest.as_ref().map(|u| u.total).unwrap_or(0),
                    in_flight: 0,
                    eta_seconds: None,
                    state: final_state,
                });
                drop(events);
                *thread_shared.state.lock() = final_state;
                thread_shared.event_ready.notify_all();
            })
            .map_err(|e| RetrodictError::internal(format!("cannot spawn run thread: {}", e)))?;

        self.runs.insert(
            run_id,
            Arc::new(RunHandle {
                shared,
                worker: Mutex::new(Some(worker)),
            }),
        );
        info!(target: "retrodict::service", run = %run_id, "run submitted");
        Ok(run_id)
    }

    fn handle(&self, run_id: RunId) -> Result<Arc<RunHandle>> {
        self.runs
            .get(&run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RetrodictError::not_found(run_id.to_string()))
    }

    /// Current status of a run
    pub fn status(&self, run_id: RunId) -> Result<RunStatus> {
        let handle = self.handle(run_id)?;
        let state = *handle.shared.state.lock();
        let latest = handle.shared.latest.lock().clone();
        let (progress, in_flight, eta) = match (&state, latest) {
            (RunState::Completed | RunState::Failed | RunState::Cancelled, _) => (1.0, 0, None),
            (_, Some(update)) if update.total > 0 => (
                update.completed as f64 / update.total as f64,
                update.in_flight,
                update.eta_seconds,
            ),
            _ => (0.0, 0, None),
        };
        Ok(RunStatus {
            state,
            progress,
            in_flight,
            eta_seconds: eta,
        })
    }

    /// Cancel a run; acknowledged immediately, applied cooperatively
    pub fn cancel(&self, run_id: RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        handle.shared.token.cancel();
        Ok(())
    }

    /// Fetch the summary of a terminal run
    pub fn results(&self, run_id: RunId) -> Result<RunSummary> {
        let handle = self.handle(run_id)?;
        let summary = handle.shared.summary.lock().clone();
        summary
            .ok_or_else(|| RetrodictError::invariant(format!("run {} has no results yet", run_id)))
    }

    /// Lazy stream of progress events, ending at the terminal event
    pub fn events(&self, run_id: RunId) -> Result<EventStream> {
        let handle = self.handle(run_id)?;
        Ok(EventStream {
            shared: Arc::clone(&handle.shared),
            cursor: 0,
        })
    }

    /// Block until a run reaches a terminal state
    pub fn wait(&self, run_id: RunId) -> Result<RunState> {
        let handle = self.handle(run_id)?;
        if let Some(worker) = handle.worker.lock().take() {
            if worker.join().is_err() {
                warn!(target: "retrodict::service", run = %run_id, "run thread panicked");
                *handle.shared.state.lock() = RunState::Failed;
            }
        }
        let state = *handle.shared.state.lock();
        Ok(state)
    }
}

/// Blocking iterator over a run's progress events
pub struct EventStream {
    shared: Arc<RunShared>,
    cursor: usize,
}

impl Iterator for EventStream {
    type Item = RunEvent;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            {
                let events = self.shared.events.lock();
                if self.cursor < events.len() {
                    let event = events[self.cursor].clone();
                    self.cursor += 1;
                    return Some(event);
                }
                // the terminal event is always last; past it the stream ends
                if let Some(last) = events.last() {
                    if last.state.is_terminal() && self.cursor >= events.len() {
                        return None;
                    }
                }
                // a run that died without a terminal event still ends the
                // stream once its state settles
                if self.shared.state.lock().is_terminal() {
                    return None;
                }
            }
            let mut events = self.shared.events.lock();
            if self.cursor >= events.len() {
                self.shared
                    .event_ready
                    .wait_for(&mut events, Duration::from_millis(100));
            }
        }
    }
}
