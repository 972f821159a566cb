//! End-to-end training scenarios
//!
//! Drives the full stack (pipeline + service) against real on-disk data:
//! happy path, cancellation, backend fallback, timeout, audit replay
//! fidelity, and the boundary conventions.

use retrodict::engine::{Effect, Rule, RuleRegistry, Trigger, WorldSnapshot, WorldState};
use retrodict::storage::{ColumnarBackend, RowBackend, RowBlock, StorageBackend};
use retrodict::{
    CoordinatorConfig, PipelinePaths, RunRequest, RunState, TrainingPipeline, TrainingService,
};
use retrodict_coordinator::CancellationToken;
use retrodict_durability::{AuditKind, AuditTrail};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// `RUST_LOG`-style output for debugging test failures
fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
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

fn frozen_rules() -> Arc<retrodict::engine::FrozenRules> {
    let mut registry = RuleRegistry::new();
    registry.register(bump_rule()).unwrap();
    registry.freeze().unwrap()
}

/// Deterministic observations: x alternates around the trigger
/// threshold and y rises exactly when the rule would have fired.
fn observations(rows: usize) -> RowBlock {
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
    RowBlock::new((0..rows as i64).map(|i| i * 10).collect(), columns).unwrap()
}

fn seed_columnar(root: &Path, rows: usize) {
    ColumnarBackend::new(root.join("data"))
        .write("obs", &observations(rows), &Default::default())
        .unwrap();
}

fn base_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.max_workers = 2;
    config.batch_window_secs = 300; // 30 rows per batch
    config.sample_interval_secs = 10;
    config.min_sample_batches = 1_000_000;
    config.checkpoint_interval_turns = 8;
    config
}

fn request(rows: usize, config: CoordinatorConfig) -> RunRequest {
    RunRequest {
        variables: vec!["x".to_string(), "y".to_string()],
        start: 0,
        end: rows as i64 * 10,
        dataset_id: "obs".to_string(),
        config,
    }
}

#[test]
fn happy_path_trains_and_persists() {
    init_tracing();
    let root = TempDir::new().unwrap();
    seed_columnar(root.path(), 120);
    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));

    let summary = pipeline
        .run(request(120, base_config()), CancellationToken::new(), None)
        .unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.batches.total, 4);
    assert_eq!(summary.batches.succeeded, 4);
    assert_eq!(summary.batches.success_rate, 1.0);
    assert_eq!(summary.exit_code(), 0);

    // Every fired turn matched the data by construction, so the posterior
    // mean sits near 1 with a tight interval.
    let mean = summary.variables.trust_scores["R1"];
    assert!(mean > 0.9, "mean was {}", mean);
    let (lo, hi) = summary.variables.trust_intervals["R1"];
    assert!(lo > 0.8 && hi <= 1.0);

    // summary landed on disk, key-ordered and loadable
    let path = root
        .path()
        .join("results")
        .join(format!("{}.json", summary.run_id));
    assert!(path.exists());
    let loaded: retrodict::RunSummary =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(loaded.batches, summary.batches);

    // stage timings recorded for every stage
    for stage in ["config", "data_load", "training", "evaluation", "results_upload"] {
        assert!(summary.stage_seconds.contains_key(stage), "missing {}", stage);
    }
}

#[test]
fn trust_arithmetic_from_uniform_prior() {
    init_tracing();
    // One batch over 4 rows where the rule fires 3 times, matching the
    // data each time: alpha = 1 + 3, beta = 1.
    let root = TempDir::new().unwrap();
    let mut columns = BTreeMap::new();
    columns.insert("x".to_string(), vec![12.0, 12.0, 12.0, 12.0]);
    columns.insert("y".to_string(), vec![0.0, 1.0, 2.0, 3.0]);
    let block = RowBlock::new(vec![0, 10, 20, 30], columns).unwrap();
    ColumnarBackend::new(root.path().join("data"))
        .write("obs", &block, &Default::default())
        .unwrap();

    let mut config = base_config();
    config.batch_window_secs = 1000;
    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));
    let summary = pipeline
        .run(request(4, config), CancellationToken::new(), None)
        .unwrap();

    // mean = alpha / (alpha + beta) = 4 / 5
    let mean = summary.variables.trust_scores["R1"];
    assert!((mean - 0.8).abs() < 1e-9, "mean was {}", mean);
}

#[test]
fn cancellation_mid_run_writes_partial_summary() {
    init_tracing();
    let root = TempDir::new().unwrap();
    seed_columnar(root.path(), 2_000);
    let mut config = base_config();
    config.max_workers = 1;
    config.batch_window_secs = 500;
    let pipeline = Arc::new(TrainingPipeline::new(
        frozen_rules(),
        PipelinePaths::under(root.path()),
    ));
    let service = TrainingService::new(Arc::clone(&pipeline));

    let run_id = service.submit_run(request(2_000, config)).unwrap();

    // wait for the first completion event, then cancel
    let mut events = service.events(run_id).unwrap();
    let first = events.next().unwrap();
    assert!(first.completed >= 1);
    service.cancel(run_id).unwrap();

    let state = service.wait(run_id).unwrap();
    assert_eq!(state, RunState::Cancelled);

    let summary = service.results(run_id).unwrap();
    assert_eq!(summary.state, RunState::Cancelled);
    assert!(summary.batches.succeeded >= 1);
    assert!(summary.batches.cancelled >= 1);
    assert_eq!(summary.exit_code(), 3);

    // the event stream terminates with the terminal state
    let last = events.last().unwrap();
    assert_eq!(last.state, RunState::Cancelled);
}

#[test]
fn row_backend_serves_when_columnar_is_absent() {
    init_tracing();
    let root = TempDir::new().unwrap();
    // Only the row-oriented backend has the dataset.
    RowBackend::new(root.path().join("data"))
        .write("obs", &observations(60), &Default::default())
        .unwrap();

    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));
    let summary = pipeline
        .run(request(60, base_config()), CancellationToken::new(), None)
        .unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.batches.failed, 0);
    assert_eq!(summary.batches.succeeded, 2);
}

#[test]
fn batch_timeout_fails_without_trust() {
    init_tracing();
    let root = TempDir::new().unwrap();
    seed_columnar(root.path(), 600);
    let mut config = base_config();
    config.batch_window_secs = 6_000; // one big batch
    config.batch_timeout_ms = 1;
    config.max_retries = 0;

    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));
    let summary = pipeline
        .run(request(600, config), CancellationToken::new(), None)
        .unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.batches.failed, 1);
    assert_eq!(summary.batches.succeeded, 0);
    // all-or-nothing: no posterior moved
    assert!(summary.variables.trust_scores.is_empty());
    assert_eq!(summary.exit_code(), 4);
}

#[test]
fn audit_trail_verifies_and_checkpoints_roundtrip() {
    init_tracing();
    let root = TempDir::new().unwrap();
    seed_columnar(root.path(), 60);
    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));
    let summary = pipeline
        .run(request(60, base_config()), CancellationToken::new(), None)
        .unwrap();

    let trail = AuditTrail::open(root.path().join("trail")).unwrap();
    let report = trail.verify(summary.run_id).unwrap();
    assert!(report.is_valid);
    assert!(report.length > 0);

    let records: Vec<_> = trail.replay(summary.run_id, None).unwrap().collect();
    let mut checkpoints = 0;
    for record in &records {
        if record.kind != AuditKind::Checkpoint {
            continue;
        }
        checkpoints += 1;
        // every checkpoint reconstructs a world bit-identically
        let snapshot: WorldSnapshot = serde_json::from_value(record.payload.clone()).unwrap();
        let world = WorldState::from_snapshot(&snapshot).unwrap();
        assert_eq!(world.snapshot(), snapshot);
        assert_eq!(world.snapshot().content_hash(), snapshot.content_hash());
    }
    assert!(checkpoints >= summary.batches.total);

    // the plan lands before any batch record and preserves planning order
    assert_eq!(records[0].kind, AuditKind::Plan);
    let planned = records[0].payload["batches"].as_array().unwrap();
    assert_eq!(planned.len(), summary.batches.total);
    let indices: Vec<u64> = planned
        .iter()
        .map(|b| b["planning_index"].as_u64().unwrap())
        .collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]));

    // ordering: per batch, sequence of kinds is start..turns..end
    let mut per_batch: BTreeMap<&str, Vec<AuditKind>> = BTreeMap::new();
    for record in records.iter().filter(|r| !r.batch_id.is_empty()) {
        per_batch
            .entry(record.batch_id.as_str())
            .or_default()
            .push(record.kind);
    }
    for kinds in per_batch.values() {
        assert_eq!(kinds.first(), Some(&AuditKind::Start));
        assert_eq!(kinds.last(), Some(&AuditKind::End));
    }
}

#[test]
fn remote_results_file_uri_uploads_summary() {
    init_tracing();
    let root = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    seed_columnar(root.path(), 60);

    let mut config = base_config();
    config.remote_results_uri = Some(format!("file://{}", remote.path().display()));
    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));
    let summary = pipeline
        .run(request(60, config), CancellationToken::new(), None)
        .unwrap();

    let uri = summary.remote_uri.as_ref().unwrap();
    assert!(uri.starts_with("file://"));
    assert!(summary.remote_error.is_none());
    assert!(remote
        .path()
        .join(format!("{}.json", summary.run_id))
        .exists());
}

#[test]
fn unsupported_remote_scheme_is_tolerated() {
    init_tracing();
    let root = TempDir::new().unwrap();
    seed_columnar(root.path(), 60);

    let mut config = base_config();
    config.remote_results_uri = Some("s3://bucket/results".to_string());
    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));
    let summary = pipeline
        .run(request(60, config), CancellationToken::new(), None)
        .unwrap();

    // the run still completes and the local summary lands
    assert_eq!(summary.state, RunState::Completed);
    assert!(summary.remote_uri.is_none());
    assert!(summary.remote_error.is_some());
}

#[test]
fn empty_variable_set_completes_vacuously() {
    init_tracing();
    let root = TempDir::new().unwrap();
    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));

    let mut req = request(0, base_config());
    req.variables.clear();
    req.start = 0;
    req.end = 0;
    let summary = pipeline.run(req, CancellationToken::new(), None).unwrap();

    assert_eq!(summary.state, RunState::Completed);
    assert_eq!(summary.batches.total, 0);
    assert_eq!(summary.batches.success_rate, 1.0);
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn single_and_multi_worker_runs_agree() {
    init_tracing();
    let mut outcomes = Vec::new();
    for workers in [1, 4] {
        let root = TempDir::new().unwrap();
        seed_columnar(root.path(), 240);
        let mut config = base_config();
        config.max_workers = workers;
        let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));
        let summary = pipeline
            .run(request(240, config), CancellationToken::new(), None)
            .unwrap();
        outcomes.push((
            summary.batches.clone(),
            summary.variables.trust_scores.clone(),
        ));
    }
    assert_eq!(outcomes[0].0.succeeded, outcomes[1].0.succeeded);
    assert_eq!(outcomes[0].1, outcomes[1].1);
}

#[test]
fn service_status_reflects_lifecycle() {
    init_tracing();
    let root = TempDir::new().unwrap();
    seed_columnar(root.path(), 120);
    let pipeline = Arc::new(TrainingPipeline::new(
        frozen_rules(),
        PipelinePaths::under(root.path()),
    ));
    let service = TrainingService::new(pipeline);

    let run_id = service.submit_run(request(120, base_config())).unwrap();
    let state = service.wait(run_id).unwrap();
    assert_eq!(state, RunState::Completed);

    let status = service.status(run_id).unwrap();
    assert_eq!(status.state, RunState::Completed);
    assert_eq!(status.progress, 1.0);
    assert_eq!(status.in_flight, 0);

    assert!(service.results(run_id).is_ok());
    assert!(service.status(retrodict::RunId::new()).is_err());
}

#[test]
fn training_stage_resumes_from_persisted_report() {
    init_tracing();
    let root = TempDir::new().unwrap();
    seed_columnar(root.path(), 120);
    let pipeline = TrainingPipeline::new(frozen_rules(), PipelinePaths::under(root.path()));

    let first = pipeline
        .run(request(120, base_config()), CancellationToken::new(), None)
        .unwrap();

    // Re-running under the same id must resume from the persisted
    // training report and reproduce the same aggregate.
    let second = pipeline
        .run_with_id(
            first.run_id,
            request(120, base_config()),
            CancellationToken::new(),
            None,
        )
        .unwrap();

    assert_eq!(second.batches, first.batches);
    assert_eq!(second.variables.trust_scores, first.variables.trust_scores);
}
