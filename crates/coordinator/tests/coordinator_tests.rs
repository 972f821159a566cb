//! Coordinator integration tests
//!
//! These exercise the full worker pool against a real on-disk store:
//!
//! 1. **Aggregation determinism** - identical batches produce identical
//!    counts and trust posteriors regardless of worker count
//! 2. **Cancellation** - after the signal, no new batch starts and the
//!    remainder finalizes cancelled
//! 3. **Partial failure** - one failing batch never aborts the run
//! 4. **Run-abort gate** - a collapsing success ratio cancels the rest

use retrodict_coordinator::{
    plan, CancellationToken, Coordinator, CoordinatorDeps, MetricRecord, MetricsCollector,
    MetricsConfig, MetricsSink, PlanRequest, ProgressUpdate,
};
use retrodict_core::{CoordinatorConfig, DecayPhase, Result, RunId, RunState};
use retrodict_durability::AuditTrail;
use retrodict_engine::{Effect, Rule, RuleRegistry, Trigger, TurnConfig, TurnRunner};
use retrodict_storage::{ColumnarBackend, DataStore, RowBlock, StorageBackend, StoreConfig};
use retrodict_trust::{TrustBuffer, TrustBufferConfig, TrustTracker};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

struct NullSink;
impl MetricsSink for NullSink {
    fn emit(&self, _record: &MetricRecord) -> Result<()> {
        Ok(())
    }
}

fn seed_dataset(dir: &TempDir, rows: usize) {
    // x oscillates around the trigger threshold; y rises whenever x was
    // above it, so the bump rule scores consistent successes.
    let mut xs = Vec::with_capacity(rows);
    let mut ys = Vec::with_capacity(rows);
    let mut y = 0.0;
    for i in 0..rows {
        let x = if i % 2 == 0 { 12.0 } else { 5.0 };
        if i > 0 && xs[i - 1] > 10.0 {
            y += 1.0;
        }
        xs.push(x);
        ys.push(y);
    }
    let mut columns = BTreeMap::new();
    columns.insert("x".to_string(), xs);
    columns.insert("y".to_string(), ys);
    let timestamps: Vec<i64> = (0..rows as i64).map(|i| i * 10).collect();
    let block = RowBlock::new(timestamps, columns).unwrap();
    ColumnarBackend::new(dir.path())
        .write("obs", &block, &Default::default())
        .unwrap();
}

fn bump_rule() -> Rule {
    Rule::new(
        "R1",
        Trigger::VariableAbove {
            name: "x".to_string(),
            threshold: 10.0,
        },
        vec![Effect::AdjustVariable {
            name: "y".to_string(),
            delta: 1.0,
        }],
    )
}

struct Harness {
    _data_dir: TempDir,
    _trail_dir: TempDir,
    coordinator: Coordinator,
    tracker: Arc<TrustTracker>,
    buffer: Arc<TrustBuffer>,
    metrics: Arc<MetricsCollector>,
    store: DataStore,
}

fn harness(rows: usize, max_workers: usize, configure: impl FnOnce(&mut CoordinatorConfig)) -> Harness {
    let data_dir = TempDir::new().unwrap();
    let trail_dir = TempDir::new().unwrap();
    seed_dataset(&data_dir, rows);

    let store = DataStore::open(StoreConfig::new(data_dir.path()), None).unwrap();
    let mut registry = RuleRegistry::new();
    registry.register(bump_rule()).unwrap();
    let runner = TurnRunner::new(
        registry.freeze().unwrap(),
        TurnConfig {
            decay_rate: 0.0,
            decay_phase: DecayPhase::AfterRules,
        },
    );

    let tracker = Arc::new(TrustTracker::with_shards(8));
    let buffer = TrustBuffer::new(Arc::clone(&tracker), TrustBufferConfig::default());
    let metrics = Arc::new(MetricsCollector::new(
        Arc::new(NullSink),
        MetricsConfig::default(),
        None,
    ));
    let trail = Arc::new(AuditTrail::open(trail_dir.path()).unwrap());

    let mut config = CoordinatorConfig::default();
    config.max_workers = max_workers;
    config.queue_depth = 8;
    config.min_sample_batches = 1_000_000; // gate off unless a test lowers it
    configure(&mut config);

    let deps = CoordinatorDeps {
        store: store.clone(),
        runner,
        buffer: Arc::clone(&buffer),
        metrics: Arc::clone(&metrics),
        trail,
        dataset_id: "obs".to_string(),
    };
    Harness {
        _data_dir: data_dir,
        _trail_dir: trail_dir,
        coordinator: Coordinator::new(config, deps).unwrap(),
        tracker,
        buffer,
        metrics,
        store,
    }
}

fn batches_over(rows: usize, window: i64) -> Vec<retrodict_coordinator::TrainingBatch> {
    plan(&PlanRequest {
        variables: vec!["x".to_string(), "y".to_string()],
        start: 0,
        end: rows as i64 * 10,
        window_secs: window,
        step_secs: window,
        sample_interval_secs: 10,
    })
    .unwrap()
}

#[test]
fn aggregation_is_worker_count_independent() {
    let mut snapshots = Vec::new();
    for workers in [1, 4] {
        let h = harness(240, workers, |_| {});
        let batches = batches_over(240, 300);
        assert_eq!(batches.len(), 8);

        let report = h
            .coordinator
            .run(RunId::new(), batches, CancellationToken::new(), None)
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        let (succeeded, failed, cancelled) = report.counts();
        assert_eq!((succeeded, failed, cancelled), (8, 0, 0));

        h.buffer.close();
        snapshots.push(h.tracker.snapshot());
        h.metrics.close();
        h.store.close().unwrap();
    }
    assert_eq!(snapshots[0], snapshots[1]);
}

#[test]
fn progress_reports_arrive_in_order() {
    let h = harness(120, 2, |_| {});
    let batches = batches_over(120, 300);
    let seen: Arc<Mutex<Vec<ProgressUpdate>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_cb = Arc::clone(&seen);

    let report = h
        .coordinator
        .run(
            RunId::new(),
            batches,
            CancellationToken::new(),
            Some(Box::new(move |update| {
                seen_cb.lock().unwrap().push(update);
            })),
        )
        .unwrap();
    assert_eq!(report.state, RunState::Completed);

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    let completions: Vec<usize> = seen.iter().map(|u| u.completed).collect();
    let mut sorted = completions.clone();
    sorted.sort_unstable();
    assert_eq!(completions, sorted);
    assert_eq!(*completions.last().unwrap(), 4);

    h.buffer.close();
    h.metrics.close();
    h.store.close().unwrap();
}

#[test]
fn cancellation_before_start_cancels_everything() {
    let h = harness(120, 2, |_| {});
    let batches = batches_over(120, 300);
    let token = CancellationToken::new();
    token.cancel();

    let report = h
        .coordinator
        .run(RunId::new(), batches, token, None)
        .unwrap();
    assert_eq!(report.state, RunState::Cancelled);
    let (succeeded, failed, cancelled) = report.counts();
    assert_eq!(succeeded, 0);
    assert_eq!(failed, 0);
    assert_eq!(cancelled, 4);
    // no trust applied for cancelled work
    h.buffer.close();
    assert!(h.tracker.is_empty());
    h.metrics.close();
    h.store.close().unwrap();
}

#[test]
fn cancellation_mid_run_keeps_finished_results() {
    let h = harness(2_000, 1, |config| {
        config.queue_depth = 2;
    });
    let batches = batches_over(2_000, 500);
    assert!(batches.len() > 10);
    let token = CancellationToken::new();

    let cancel_after = 2usize;
    let token_cb = token.clone();
    let report = h
        .coordinator
        .run(
            RunId::new(),
            batches.clone(),
            token,
            Some(Box::new(move |update| {
                if update.completed >= cancel_after {
                    token_cb.cancel();
                }
            })),
        )
        .unwrap();

    assert_eq!(report.state, RunState::Cancelled);
    let (succeeded, _failed, cancelled) = report.counts();
    assert!(succeeded >= cancel_after);
    assert!(cancelled > 0);
    assert_eq!(report.results.len(), batches.len());

    h.buffer.close();
    h.metrics.close();
    h.store.close().unwrap();
}

#[test]
fn one_failing_batch_never_aborts_the_run() {
    // One window carries poisoned observations (x spikes past the drain
    // rule's threshold), so every turn there aborts and that batch fails
    // on the abort-ratio gate; the others succeed and the run completes.
    let data_dir = TempDir::new().unwrap();
    let trail_dir = TempDir::new().unwrap();

    let rows = 120usize;
    let mut xs = Vec::with_capacity(rows);
    let mut ys = Vec::with_capacity(rows);
    let mut y = 0.0;
    for i in 0..rows {
        let x = if (30..60).contains(&i) {
            200.0
        } else if i % 2 == 0 {
            12.0
        } else {
            5.0
        };
        if i > 0 && xs[i - 1] > 10.0 && xs[i - 1] < 100.0 {
            y += 1.0;
        }
        xs.push(x);
        ys.push(y);
    }
    let mut columns = BTreeMap::new();
    columns.insert("x".to_string(), xs);
    columns.insert("y".to_string(), ys);
    let timestamps: Vec<i64> = (0..rows as i64).map(|i| i * 10).collect();
    ColumnarBackend::new(data_dir.path())
        .write("obs", &RowBlock::new(timestamps, columns).unwrap(), &Default::default())
        .unwrap();

    let store = DataStore::open(StoreConfig::new(data_dir.path()), None).unwrap();
    let mut registry = RuleRegistry::new();
    registry.register(bump_rule()).unwrap();
    registry
        .register(Rule::new(
            "drain",
            Trigger::VariableAbove {
                name: "x".to_string(),
                threshold: 100.0,
            },
            vec![Effect::AdjustCash { delta: -1e12 }],
        ))
        .unwrap();
    let runner = TurnRunner::new(
        registry.freeze().unwrap(),
        TurnConfig {
            decay_rate: 0.0,
            decay_phase: DecayPhase::AfterRules,
        },
    );

    let tracker = Arc::new(TrustTracker::with_shards(4));
    let buffer = TrustBuffer::new(Arc::clone(&tracker), TrustBufferConfig::default());
    let metrics = Arc::new(MetricsCollector::new(
        Arc::new(NullSink),
        MetricsConfig::default(),
        None,
    ));
    let trail = Arc::new(AuditTrail::open(trail_dir.path()).unwrap());

    let mut config = CoordinatorConfig::default();
    config.max_workers = 2;
    config.min_sample_batches = 1_000_000;

    let coordinator = Coordinator::new(
        config,
        CoordinatorDeps {
            store: store.clone(),
            runner,
            buffer: Arc::clone(&buffer),
            metrics: Arc::clone(&metrics),
            trail,
            dataset_id: "obs".to_string(),
        },
    )
    .unwrap();

    let batches = batches_over(120, 300);
    assert_eq!(batches.len(), 4);
    let report = coordinator
        .run(RunId::new(), batches, CancellationToken::new(), None)
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    let (succeeded, failed, cancelled) = report.counts();
    assert_eq!(failed, 1);
    assert_eq!(succeeded, 3);
    assert_eq!(cancelled, 0);
    let failed_result = report
        .results
        .iter()
        .find(|r| !r.succeeded())
        .unwrap();
    assert!(failed_result.error.as_ref().unwrap().contains("rule_execution"));
    // the failed batch contributed no trust
    assert!(failed_result.trust_deltas.is_empty());

    buffer.close();
    metrics.close();
    store.close().unwrap();
}

#[test]
fn run_abort_gate_cancels_remaining() {
    // dataset id mismatch: every batch fails on NotFound, tripping the
    // gate after the minimum sample.
    let data_dir = TempDir::new().unwrap();
    let trail_dir = TempDir::new().unwrap();
    seed_dataset(&data_dir, 120);
    let store = DataStore::open(StoreConfig::new(data_dir.path()), None).unwrap();

    let mut registry = RuleRegistry::new();
    registry.register(bump_rule()).unwrap();
    let runner = TurnRunner::new(registry.freeze().unwrap(), TurnConfig::default());

    let tracker = Arc::new(TrustTracker::with_shards(4));
    let buffer = TrustBuffer::new(Arc::clone(&tracker), TrustBufferConfig::default());
    let metrics = Arc::new(MetricsCollector::new(
        Arc::new(NullSink),
        MetricsConfig::default(),
        None,
    ));
    let trail = Arc::new(AuditTrail::open(trail_dir.path()).unwrap());

    let mut config = CoordinatorConfig::default();
    config.max_workers = 2;
    config.min_sample_batches = 2;
    config.min_success_ratio = 0.5;
    config.max_retries = 0;

    let coordinator = Coordinator::new(
        config,
        CoordinatorDeps {
            store: store.clone(),
            runner,
            buffer: Arc::clone(&buffer),
            metrics: Arc::clone(&metrics),
            trail,
            dataset_id: "wrong-dataset".to_string(),
        },
    )
    .unwrap();

    let batches = batches_over(120, 100);
    assert!(batches.len() >= 4);
    let report = coordinator
        .run(RunId::new(), batches, CancellationToken::new(), None)
        .unwrap();

    assert_eq!(report.state, RunState::Failed);
    let (succeeded, failed, _cancelled) = report.counts();
    assert_eq!(succeeded, 0);
    assert!(failed >= 2);

    buffer.close();
    metrics.close();
    store.close().unwrap();
}

#[test]
fn empty_plan_completes_with_success_rate_convention() {
    let h = harness(10, 2, |_| {});
    let report = h
        .coordinator
        .run(RunId::new(), Vec::new(), CancellationToken::new(), None)
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert!(report.results.is_empty());
    h.buffer.close();
    h.metrics.close();
    h.store.close().unwrap();
}
