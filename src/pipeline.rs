//! Training pipeline
//!
//! Staged orchestration of a whole run:
//! `Config -> DataLoad -> Training -> Evaluation -> ResultsUpload`.
//!
//! Each stage is a command executed against a shared context. Failure in a
//! required stage short-circuits what follows, with one exception:
//! ResultsUpload is always attempted once Training has succeeded, even if
//! Evaluation failed (Evaluation is declared optional). The pipeline is
//! restart-safe at stage granularity: Training persists its report, and a
//! rerun of the same run id resumes from it instead of re-executing.

use retrodict_coordinator::{
    plan, CancellationToken, Coordinator, CoordinatorDeps, Curriculum, CurriculumConfig,
    MetricsCollector, MetricsConfig, MetricsSink, PlanRequest, ProgressCallback, RunReport,
    TrainingResult,
};
use retrodict_core::{
    now_seconds, CoordinatorConfig, Result, RetrodictError, RunId, RunState, RunSummary, Timestamp,
};
use retrodict_durability::{persist, AuditKind, AuditTrail, RemoteSink};
use retrodict_engine::{FrozenRules, TurnConfig, TurnRunner};
use retrodict_storage::{DataStore, StoreConfig};
use retrodict_trust::{TrustBuffer, TrustBufferConfig, TrustTracker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A run submission
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Variables to replay
    pub variables: Vec<String>,
    /// Range start (inclusive), Unix seconds
    pub start: Timestamp,
    /// Range end (exclusive), Unix seconds
    pub end: Timestamp,
    /// Dataset holding the observed rows
    pub dataset_id: String,
    /// Coordinator configuration (already merged with env overrides)
    pub config: CoordinatorConfig,
}

/// Filesystem layout the pipeline works in
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    /// Data store root
    pub data_root: PathBuf,
    /// Audit trail directory
    pub trail_dir: PathBuf,
    /// Results directory (summaries + stage checkpoints)
    pub results_dir: PathBuf,
}

impl PipelinePaths {
    /// Conventional layout under one root
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        PipelinePaths {
            data_root: root.join("data"),
            trail_dir: root.join("trail"),
            results_dir: root.join("results"),
        }
    }
}

/// Sink that drops metrics; the default when no sink is wired
struct DiscardSink;
impl MetricsSink for DiscardSink {
    fn emit(&self, _record: &retrodict_coordinator::MetricRecord) -> Result<()> {
        Ok(())
    }
}

/// Shared context threaded through the stages
struct PipelineContext {
    run_id: RunId,
    request: RunRequest,
    paths: PipelinePaths,
    token: CancellationToken,
    progress: Option<ProgressCallback>,
    store: Option<DataStore>,
    tracker: Arc<TrustTracker>,
    report: Option<RunReport>,
    summary: RunSummary,
}

impl PipelineContext {
    fn training_report_path(&self) -> PathBuf {
        self.paths
            .results_dir
            .join(format!("{}.training.json", self.run_id))
    }
}

trait Stage {
    fn name(&self) -> &'static str;
    fn optional(&self) -> bool {
        false
    }
    fn execute(
        &self,
        pipeline: &TrainingPipeline,
        ctx: &mut PipelineContext,
    ) -> Result<()>;
}

struct ConfigStage;
struct DataLoadStage;
struct TrainingStage;
struct EvaluationStage;
struct ResultsUploadStage;

impl Stage for ConfigStage {
    fn name(&self) -> &'static str {
        "config"
    }

    fn execute(&self, _p: &TrainingPipeline, ctx: &mut PipelineContext) -> Result<()> {
        ctx.request.config.validate()?;
        if ctx.request.variables.is_empty() && ctx.request.start < ctx.request.end {
            return Err(RetrodictError::configuration(
                "run needs at least one variable",
            ));
        }
        std::fs::create_dir_all(&ctx.paths.results_dir)?;
        Ok(())
    }
}

impl Stage for DataLoadStage {
    fn name(&self) -> &'static str {
        "data_load"
    }

    fn execute(&self, pipeline: &TrainingPipeline, ctx: &mut PipelineContext) -> Result<()> {
        let config = &ctx.request.config;
        let store_config = StoreConfig {
            root: ctx.paths.data_root.clone(),
            cache_bytes: config.cache_bytes,
            prefetch_blocks: config.prefetch_blocks,
            eager_row_limit: config.stream_batch_rows.max(1),
        };
        let store = DataStore::open(store_config, pipeline.remote_data.take_client())?;

        // Verify the dataset exists somewhere in the chain before any
        // worker starts; a run over nothing is a configuration error.
        if ctx.request.start < ctx.request.end {
            let manifest = store.manifest(&ctx.request.dataset_id)?;
            for variable in &ctx.request.variables {
                if !manifest.column_names.contains(variable) {
                    return Err(RetrodictError::configuration(format!(
                        "dataset {} has no column {}",
                        ctx.request.dataset_id, variable
                    )));
                }
            }
        }
        ctx.store = Some(store);
        Ok(())
    }
}

impl Stage for TrainingStage {
    fn name(&self) -> &'static str {
        "training"
    }

    fn execute(&self, pipeline: &TrainingPipeline, ctx: &mut PipelineContext) -> Result<()> {
        // Restart safety: a persisted report short-circuits re-execution.
        let report_path = ctx.training_report_path();
        if report_path.exists() {
            let raw = std::fs::read(&report_path)?;
            let results: Vec<TrainingResult> = serde_json::from_slice(&raw)?;
            info!(
                target: "retrodict::pipeline",
                run = %ctx.run_id,
                batches = results.len(),
                "resuming from persisted training report"
            );
            // Rebuild the tracker from the persisted per-batch deltas.
            let aggregate = Coordinator::aggregate_trust(&results);
            let deltas: Vec<_> = aggregate
                .into_iter()
                .map(|(id, (s, f))| (retrodict_core::RuleId::new(id), s, f))
                .collect();
            ctx.tracker.batch_update(&deltas, 0);
            ctx.report = Some(RunReport {
                state: RunState::Completed,
                results,
                wall_seconds: 0.0,
                stats: Default::default(),
            });
            return Ok(());
        }

        let config = ctx.request.config.clone();
        let mut batches = plan(&PlanRequest {
            variables: ctx.request.variables.clone(),
            start: ctx.request.start,
            end: ctx.request.end,
            window_secs: config.batch_window_secs,
            step_secs: config.effective_step_secs(),
            sample_interval_secs: config.sample_interval_secs,
        })?;

        if config.curriculum_enabled {
            let curriculum = Curriculum::new(&pipeline.rules, CurriculumConfig::default());
            batches = curriculum.weigh(batches, &ctx.tracker);
        }

        let buffer = TrustBuffer::new(
            Arc::clone(&ctx.tracker),
            TrustBufferConfig {
                flush_threshold: config.trust_flush_threshold,
                auto_flush_interval: config.trust_flush_interval(),
            },
        );
        let metrics = Arc::new(MetricsCollector::new(
            pipeline
                .metrics_sink
                .clone()
                .unwrap_or_else(|| Arc::new(DiscardSink)),
            MetricsConfig {
                queue_size: config.metrics_queue_size,
                drop_policy: config.metrics_drop_policy,
                max_retries: 3,
                retry_base_delay: Duration::from_millis(10),
                close_timeout: Duration::from_secs(5),
            },
            None,
        ));
        let trail = Arc::new(AuditTrail::open(&ctx.paths.trail_dir)?);
        // The trail preserves planning order even though completion order
        // is nondeterministic.
        trail.append(
            ctx.run_id,
            "",
            AuditKind::Plan,
            serde_json::json!({
                "dataset": ctx.request.dataset_id,
                "batches": batches
                    .iter()
                    .map(|b| {
                        serde_json::json!({
                            "id": b.id,
                            "window_start": b.window_start,
                            "window_end": b.window_end,
                            "priority": b.priority,
                            "planning_index": b.planning_index,
                        })
                    })
                    .collect::<Vec<_>>(),
            }),
        )?;
        let store = ctx
            .store
            .as_ref()
            .ok_or_else(|| RetrodictError::internal("training before data load"))?
            .clone();

        let runner = TurnRunner::new(
            Arc::clone(&pipeline.rules),
            TurnConfig {
                decay_rate: config.overlay_decay_rate,
                decay_phase: config.decay_phase,
            },
        );
        let coordinator = Coordinator::new(
            config,
            CoordinatorDeps {
                store,
                runner,
                buffer: Arc::clone(&buffer),
                metrics: Arc::clone(&metrics),
                trail: Arc::clone(&trail),
                dataset_id: ctx.request.dataset_id.clone(),
            },
        )?;

        let report = coordinator.run(
            ctx.run_id,
            batches,
            ctx.token.clone(),
            ctx.progress.take(),
        )?;

        buffer.close();
        metrics.close();
        trail.finish(ctx.run_id)?;

        // Stage checkpoint: results land on disk before the stage is
        // considered complete.
        let tmp = report_path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&report.results)?)?;
        std::fs::rename(&tmp, &report_path)?;

        if report.state == RunState::Cancelled {
            ctx.report = Some(report);
            return Err(RetrodictError::Cancelled);
        }
        ctx.report = Some(report);
        Ok(())
    }
}

impl Stage for EvaluationStage {
    fn name(&self) -> &'static str {
        "evaluation"
    }

    fn optional(&self) -> bool {
        true
    }

    fn execute(&self, pipeline: &TrainingPipeline, ctx: &mut PipelineContext) -> Result<()> {
        let report = ctx
            .report
            .as_ref()
            .ok_or_else(|| RetrodictError::internal("evaluation before training"))?;

        let (succeeded, failed, cancelled) = report.counts();
        ctx.summary.state = report.state;
        ctx.summary.batches.total = report.results.len();
        ctx.summary.batches.succeeded = succeeded;
        ctx.summary.batches.failed = failed;
        ctx.summary.batches.cancelled = cancelled;
        ctx.summary.batches.finalize();

        ctx.summary.variables.total = ctx.request.variables.len();
        for rule in pipeline.rules.rules() {
            let id = &rule.id;
            if let Some(state) = ctx.tracker.get(id) {
                ctx.summary
                    .variables
                    .trust_scores
                    .insert(id.to_string(), state.mean());
                ctx.summary
                    .variables
                    .trust_intervals
                    .insert(id.to_string(), state.ci(0.95));
            }
        }

        ctx.summary.performance.wall_seconds = report.wall_seconds;
        ctx.summary.performance.estimated_sequential_seconds =
            report.estimated_sequential_seconds();
        ctx.summary.performance.speedup = if report.wall_seconds > 0.0 {
            report.estimated_sequential_seconds() / report.wall_seconds
        } else {
            1.0
        };
        Ok(())
    }
}

/// `file://` remote sink for `remote_results_uri`
///
/// Cloud sinks are injected via `with_remote_results`; the file scheme is
/// built in so the config option works out of the box.
struct FileUriSink {
    root: PathBuf,
}

impl RemoteSink for FileUriSink {
    fn upload(&self, name: &str, bytes: &[u8]) -> Result<String> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(name);
        let tmp = self.root.join(format!("{}.tmp", name));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(format!("file://{}", path.display()))
    }
}

impl Stage for ResultsUploadStage {
    fn name(&self) -> &'static str {
        "results_upload"
    }

    fn execute(&self, pipeline: &TrainingPipeline, ctx: &mut PipelineContext) -> Result<()> {
        ctx.summary.trace_ref = ctx
            .paths
            .trail_dir
            .join(format!("{}.audit.jsonl", ctx.run_id))
            .display()
            .to_string();

        // Injected sink wins; otherwise the configured URI picks one.
        let uri_sink: Option<Box<dyn RemoteSink>> = match (
            &pipeline.remote_results,
            &ctx.request.config.remote_results_uri,
        ) {
            (Some(_), _) | (None, None) => None,
            (None, Some(uri)) => match uri.strip_prefix("file://") {
                Some(path) => Some(Box::new(FileUriSink {
                    root: PathBuf::from(path),
                })),
                None => {
                    ctx.summary.remote_error =
                        Some(format!("no sink available for remote uri {}", uri));
                    None
                }
            },
        };
        let sink = pipeline.remote_results.as_deref().or(uri_sink.as_deref());

        let persisted = persist(&ctx.summary, &ctx.paths.results_dir, sink)?;
        ctx.summary.remote_uri = persisted.remote_uri;
        if persisted.remote_error.is_some() {
            ctx.summary.remote_error = persisted.remote_error;
        }
        Ok(())
    }
}

/// Lets DataLoad borrow the remote client exactly once
///
/// `DataStore::open` takes ownership of the boxed client; a pipeline can
/// be run multiple times, so the client is handed out per run.
pub struct RemoteData {
    factory: Option<Box<dyn Fn() -> Box<dyn retrodict_storage::ObjectStoreClient> + Send + Sync>>,
}

impl RemoteData {
    /// No remote data backend
    pub fn none() -> Self {
        RemoteData { factory: None }
    }

    /// Build the remote client from a factory per run
    pub fn from_factory(
        factory: impl Fn() -> Box<dyn retrodict_storage::ObjectStoreClient> + Send + Sync + 'static,
    ) -> Self {
        RemoteData {
            factory: Some(Box::new(factory)),
        }
    }

    fn take_client(&self) -> Option<Box<dyn retrodict_storage::ObjectStoreClient>> {
        self.factory.as_ref().map(|f| f())
    }
}

/// The staged training pipeline
pub struct TrainingPipeline {
    rules: Arc<FrozenRules>,
    paths: PipelinePaths,
    remote_data: RemoteData,
    remote_results: Option<Box<dyn RemoteSink>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
}

impl TrainingPipeline {
    /// Build a pipeline over a frozen rule set and filesystem layout
    pub fn new(rules: Arc<FrozenRules>, paths: PipelinePaths) -> Self {
        TrainingPipeline {
            rules,
            paths,
            remote_data: RemoteData::none(),
            remote_results: None,
            metrics_sink: None,
        }
    }

    /// Attach a remote data backend
    pub fn with_remote_data(mut self, remote: RemoteData) -> Self {
        self.remote_data = remote;
        self
    }

    /// Attach a remote results sink
    pub fn with_remote_results(mut self, sink: Box<dyn RemoteSink>) -> Self {
        self.remote_results = Some(sink);
        self
    }

    /// Attach a metrics sink
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// The frozen rule set this pipeline trains
    pub fn rules(&self) -> &Arc<FrozenRules> {
        &self.rules
    }

    /// Execute a run under a fresh id
    pub fn run(
        &self,
        request: RunRequest,
        token: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<RunSummary> {
        self.run_with_id(RunId::new(), request, token, progress)
    }

    /// Execute (or resume) a run under an explicit id
    pub fn run_with_id(
        &self,
        run_id: RunId,
        request: RunRequest,
        token: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> Result<RunSummary> {
        let summary = RunSummary::new(run_id, request.config.clone());
        let mut ctx = PipelineContext {
            run_id,
            request,
            paths: self.paths.clone(),
            token,
            progress,
            store: None,
            tracker: Arc::new(TrustTracker::new()),
            report: None,
            summary,
        };

        let stages: [&dyn Stage; 5] = [
            &ConfigStage,
            &DataLoadStage,
            &TrainingStage,
            &EvaluationStage,
            &ResultsUploadStage,
        ];

        let mut fatal: Option<RetrodictError> = None;
        for stage in stages {
            let stage_started = now_seconds();
            let outcome = stage.execute(self, &mut ctx);
            ctx.summary
                .stage_seconds
                .insert(stage.name().to_string(), now_seconds() - stage_started);
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_cancellation() => {
                    // Cancellation is terminal but not an error: finalize
                    // what we have and still publish the summary.
                    ctx.summary.state = RunState::Cancelled;
                    let _ = EvaluationStage.execute(self, &mut ctx);
                    ctx.summary.state = RunState::Cancelled;
                    let _ = ResultsUploadStage.execute(self, &mut ctx);
                    self.close_store(&mut ctx);
                    return Ok(ctx.summary);
                }
                Err(e) if stage.optional() => {
                    warn!(
                        target: "retrodict::pipeline",
                        stage = stage.name(),
                        error = %e,
                        "optional stage failed, continuing"
                    );
                }
                Err(e) => {
                    fatal = Some(e);
                    break;
                }
            }
        }
        self.close_store(&mut ctx);

        match fatal {
            None => Ok(ctx.summary),
            Some(e) => Err(e),
        }
    }

    fn close_store(&self, ctx: &mut PipelineContext) {
        if let Some(store) = ctx.store.take() {
            if let Err(e) = store.close() {
                warn!(target: "retrodict::pipeline", error = %e, "store close failed");
            }
        }
    }
}
