//! Single-batch execution
//!
//! Replays one time window: streams observed rows from the data store,
//! advances a per-batch world through the rule set, scores each fired
//! rule's predicted direction against the observed delta, and accumulates
//! per-rule trust outcomes locally.
//!
//! Trust application is all-or-nothing per batch: outcomes reach the trust
//! buffer only after the batch succeeds, so timeouts and failures leave no
//! partial posteriors behind.

use crate::batch::{TrainingBatch, TrainingResult};
use crate::cancel::CancellationToken;
use crate::metrics::{MetricRecord, MetricsCollector};
use retrodict_core::{
    BatchStatus, CoordinatorConfig, RetrodictError, Result, RuleId, RunId, SimId,
};
use retrodict_durability::{AuditKind, AuditTrail};
use retrodict_engine::{Capital, TurnRunner, WorldState};
use retrodict_storage::{DataStore, RowFilter};
use retrodict_trust::TrustBuffer;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;

/// Everything a worker needs to execute batches
pub struct ExecutionEnv<'a> {
    /// Run the batch belongs to
    pub run_id: RunId,
    /// Dataset holding the observed rows
    pub dataset_id: &'a str,
    /// Shared read-only data store
    pub store: &'a DataStore,
    /// Turn runner over the frozen rule set
    pub runner: &'a TurnRunner,
    /// Shared write-many trust buffer
    pub buffer: &'a TrustBuffer,
    /// Shared write-many metrics collector
    pub metrics: &'a MetricsCollector,
    /// Audit trail
    pub trail: &'a AuditTrail,
    /// Resolved configuration
    pub config: &'a CoordinatorConfig,
    /// Cooperative cancellation token
    pub token: &'a CancellationToken,
}

struct DeadlineGuard {
    started: Instant,
    timeout: Option<std::time::Duration>,
}

impl DeadlineGuard {
    fn check(&self) -> Result<()> {
        if let Some(timeout) = self.timeout {
            let elapsed = self.started.elapsed();
            if elapsed > timeout {
                return Err(RetrodictError::Timeout {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
        }
        Ok(())
    }
}

/// Execute one batch to completion
///
/// Errors propagate untranslated: the coordinator retries transient I/O,
/// finalizes `Cancelled` on cancellation, and maps everything else to a
/// failed batch. An `Ok` result is always a succeeded batch with its trust
/// deltas already enqueued.
pub fn execute_batch(env: &ExecutionEnv<'_>, batch: &TrainingBatch) -> Result<TrainingResult> {
    let started = Instant::now();
    let deadline = DeadlineGuard {
        started,
        timeout: env.config.batch_timeout(),
    };

    env.trail.append(
        env.run_id,
        batch.id.as_str(),
        AuditKind::Start,
        json!({
            "variables": batch.variable_set,
            "window_start": batch.window_start,
            "window_end": batch.window_end,
            "planning_index": batch.planning_index,
        }),
    )?;

    let outcome = replay_window(env, batch, &deadline);

    match outcome {
        Ok(replay) => {
            // All-or-nothing: outcomes reach the tracker only now.
            let deltas: Vec<(RuleId, u64, u64)> = replay
                .trust
                .iter()
                .map(|(id, (s, f))| (RuleId::new(id.clone()), *s, *f))
                .collect();
            env.buffer.enqueue_batch(&deltas, replay.turns);

            let duration_secs = started.elapsed().as_secs_f64();
            env.trail.append(
                env.run_id,
                batch.id.as_str(),
                AuditKind::End,
                json!({"status": "succeeded", "turns": replay.turns, "rows": replay.rows}),
            )?;
            env.metrics.submit(
                MetricRecord::now("batch_duration_seconds", duration_secs)
                    .with_label("batch", batch.id.as_str()),
            );
            env.metrics.submit(
                MetricRecord::now("batch_rows", replay.rows as f64)
                    .with_label("batch", batch.id.as_str()),
            );

            let mut metrics = BTreeMap::new();
            metrics.insert("rows".to_string(), replay.rows as f64);
            metrics.insert("turns".to_string(), replay.turns as f64);
            metrics.insert("turn_aborts".to_string(), replay.aborts as f64);
            metrics.insert("residual_abs_sum".to_string(), replay.residual_abs_sum);

            Ok(TrainingResult {
                batch_id: batch.id.clone(),
                status: BatchStatus::Succeeded,
                duration_secs,
                trust_deltas: replay.trust,
                metrics,
                error: None,
                trace_ref: format!("{}#{}", env.run_id, batch.id),
            })
        }
        Err(e) => {
            // Mark the truncation point so replay knows the trail is
            // intentionally incomplete for this batch.
            let status = if e.is_cancellation() {
                "cancelled"
            } else {
                "failed"
            };
            let _ = env.trail.append(
                env.run_id,
                batch.id.as_str(),
                AuditKind::End,
                json!({"status": status, "error": e.to_string(), "truncated": true}),
            );
            Err(e)
        }
    }
}

struct ReplayOutcome {
    trust: BTreeMap<String, (u64, u64)>,
    rows: u64,
    turns: u64,
    aborts: u64,
    residual_abs_sum: f64,
}

fn replay_window(
    env: &ExecutionEnv<'_>,
    batch: &TrainingBatch,
    deadline: &DeadlineGuard,
) -> Result<ReplayOutcome> {
    let filter = RowFilter::time_window(batch.window_start, batch.window_end)
        .with_columns(batch.variable_set.clone());
    let stream = env
        .store
        .stream(env.dataset_id, filter, env.config.stream_batch_rows)?;

    let mut world: Option<WorldState> = None;
    let mut trust: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut rows = 0u64;
    let mut turns = 0u64;
    let mut aborts = 0u64;
    let mut residual_abs_sum = 0.0f64;
    let mut turns_since_checkpoint = 0u64;

    for item in stream {
        // data-store I/O boundary: suspension point
        env.token.check()?;
        deadline.check()?;
        let (block, _meta) = item?;

        for i in 0..block.row_count() {
            let Some((ts, observed)) = block.row(i) else {
                continue;
            };
            rows += 1;

            let Some(current) = world.as_mut() else {
                let mut fresh = WorldState::new(
                    observed.iter().map(|(k, v)| (k.to_string(), *v)),
                    Capital::with_cash(env.config.initial_cash)?,
                    SimId::new(format!("{}-{}", env.run_id, batch.id)),
                )?;
                fresh.set_timestamp(ts as f64);
                world = Some(fresh);
                continue;
            };

            // per-turn cancellation check: suspension point
            env.token.check()?;
            deadline.check()?;

            // Pre-turn variable values anchor the observed movement.
            let pre_values: BTreeMap<String, f64> = observed
                .keys()
                .map(|name| (name.to_string(), current.get_variable(name, 0.0)))
                .collect();

            let record = env.runner.run_turn(current)?;
            turns += 1;
            turns_since_checkpoint += 1;

            if record.aborted() {
                aborts += 1;
            } else {
                // Score each fired rule: did its declared direction match
                // the observed movement of the variables it wrote?
                for fired in &record.fired {
                    let Some(rule) = env.runner.rules().get(&fired.rule_id) else {
                        continue;
                    };
                    for effect in &rule.effects {
                        let Some((target, direction)) = effect.direction() else {
                            continue;
                        };
                        let Some(name) = target.strip_prefix("var:") else {
                            continue;
                        };
                        let Some(observed_value) = observed.get(name).copied() else {
                            continue;
                        };
                        let (pre, predicted) = record
                            .deltas
                            .variables
                            .get(name)
                            .copied()
                            .unwrap_or((observed_value, observed_value));
                        let observed_change = observed_value - pre;
                        residual_abs_sum += (predicted - observed_value).abs();
                        let entry = trust.entry(fired.rule_id.to_string()).or_insert((0, 0));
                        if observed_change * direction > 0.0 {
                            entry.0 += 1;
                        } else {
                            entry.1 += 1;
                        }
                    }
                }
            }

            // Reverse inference over the observed movement: which rules
            // could have produced what the data actually did.
            let observed_delta = retrodict_engine::WorldDelta {
                variables: observed
                    .iter()
                    .filter_map(|(name, value)| {
                        let pre = pre_values.get(*name).copied()?;
                        ((value - pre).abs() > 1e-9)
                            .then(|| (name.to_string(), (pre, *value)))
                    })
                    .collect(),
                overlays: BTreeMap::new(),
                capital: BTreeMap::new(),
            };
            let inferred = env.runner.rules().reverse_apply(&observed_delta);

            env.trail.append(
                env.run_id,
                batch.id.as_str(),
                AuditKind::Turn,
                json!({
                    "turn": record.turn,
                    "fired": record.fired.len(),
                    "deltas": record.deltas,
                    "inferred": inferred,
                    "pre_hash": record.pre_hash,
                    "post_hash": record.post_hash,
                    "error": record.error,
                }),
            )?;

            if turns_since_checkpoint >= env.config.checkpoint_interval_turns {
                // checkpoint write: suspension point
                env.token.check()?;
                env.trail.append(
                    env.run_id,
                    batch.id.as_str(),
                    AuditKind::Checkpoint,
                    serde_json::to_value(current.snapshot())?,
                )?;
                turns_since_checkpoint = 0;
            }

            // Re-anchor the world on the observed row before the next turn.
            for (name, value) in &observed {
                current.set_variable(name, *value)?;
            }
            current.set_timestamp(ts as f64);
        }
    }

    if turns > 0 {
        let abort_ratio = aborts as f64 / turns as f64;
        if abort_ratio > env.config.max_turn_abort_ratio {
            return Err(RetrodictError::rule_execution(
                "batch",
                format!(
                    "turn abort ratio {:.2} exceeded threshold {:.2}",
                    abort_ratio, env.config.max_turn_abort_ratio
                ),
            ));
        }
    }

    // Final checkpoint so replay can reconstruct the terminal world.
    if let Some(final_world) = &world {
        env.trail.append(
            env.run_id,
            batch.id.as_str(),
            AuditKind::Checkpoint,
            serde_json::to_value(final_world.snapshot())?,
        )?;
    }

    debug!(
        target: "retrodict::executor",
        batch = %batch.id,
        rows,
        turns,
        aborts,
        "window replayed"
    );
    Ok(ReplayOutcome {
        trust,
        rows,
        turns,
        aborts,
        residual_abs_sum,
    })
}
