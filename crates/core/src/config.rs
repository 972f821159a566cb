//! Coordinator configuration surface
//!
//! All knobs recognized by the coordinator, with serde defaults so a config
//! file may omit any section. Each option can be overridden by a
//! `RETRODICT_`-prefixed environment variable; explicit run-submit arguments
//! win over the environment, which wins over file values.

use crate::error::{RetrodictError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Load-shedding policy for the metrics queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsDropPolicy {
    /// Drop the oldest metric and count it
    DropOldest,
    /// Block the submitter until space frees up
    Block,
}

/// When overlay decay runs within a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayPhase {
    /// Decay overlays before rule effects are applied
    BeforeRules,
    /// Decay overlays after rule effects are applied (default)
    AfterRules,
}

/// Full coordinator configuration
///
/// Every field has a default; `validate()` must pass before a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Worker pool size; defaults to CPU count − 1, floor 1
    pub max_workers: usize,
    /// Time width per batch, in seconds
    pub batch_window_secs: i64,
    /// Stride between batch starts, in seconds; 0 means "equal to window"
    pub batch_step_secs: i64,
    /// Expected observation spacing, in seconds; drives expected row counts
    pub sample_interval_secs: i64,
    /// Coordinator work-queue bound; planning blocks when full
    pub queue_depth: usize,
    /// Per-batch wall-clock cap in milliseconds; 0 disables the cap
    pub batch_timeout_ms: u64,
    /// Per-batch transient retry attempts
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds
    pub retry_base_delay_ms: u64,
    /// Run aborts when the success ratio falls below this floor...
    pub min_success_ratio: f64,
    /// ...after at least this many batches completed
    pub min_sample_batches: usize,
    /// Data-store cache byte budget
    pub cache_bytes: usize,
    /// Data-store prefetch depth, in blocks
    pub prefetch_blocks: usize,
    /// Metrics queue bound
    pub metrics_queue_size: usize,
    /// Metrics load-shedding policy
    pub metrics_drop_policy: MetricsDropPolicy,
    /// Trust buffer flush threshold (aggregated entries)
    pub trust_flush_threshold: usize,
    /// Trust buffer auto-flush interval, in milliseconds
    pub trust_flush_interval_ms: u64,
    /// Audit-trail checkpoint cadence, in turns
    pub checkpoint_interval_turns: u64,
    /// Overlay decay rate applied each turn
    pub overlay_decay_rate: f64,
    /// When overlay decay runs within a turn
    pub decay_phase: DecayPhase,
    /// Per-batch rule-abort threshold: fraction of aborted turns that fails the batch
    pub max_turn_abort_ratio: f64,
    /// Whether adaptive batch weighting is enabled
    pub curriculum_enabled: bool,
    /// Optional object-store sink for run results
    pub remote_results_uri: Option<String>,
    /// Cash each batch's world starts with
    pub initial_cash: f64,
    /// Rows per streamed block on the worker read path
    pub stream_batch_rows: usize,
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            max_workers: default_max_workers(),
            batch_window_secs: 3 * 86_400,
            batch_step_secs: 0,
            sample_interval_secs: 86_400,
            queue_depth: 64,
            batch_timeout_ms: 0,
            max_retries: 3,
            retry_base_delay_ms: 50,
            min_success_ratio: 0.5,
            min_sample_batches: 8,
            cache_bytes: 256 * 1024 * 1024,
            prefetch_blocks: 4,
            metrics_queue_size: 4096,
            metrics_drop_policy: MetricsDropPolicy::DropOldest,
            trust_flush_threshold: 256,
            trust_flush_interval_ms: 200,
            checkpoint_interval_turns: 16,
            overlay_decay_rate: 0.02,
            decay_phase: DecayPhase::AfterRules,
            max_turn_abort_ratio: 0.25,
            curriculum_enabled: true,
            remote_results_uri: None,
            initial_cash: 10_000.0,
            stream_batch_rows: 1024,
        }
    }
}

impl CoordinatorConfig {
    /// Effective batch stride: `batch_step_secs`, defaulting to the window
    pub fn effective_step_secs(&self) -> i64 {
        if self.batch_step_secs > 0 {
            self.batch_step_secs
        } else {
            self.batch_window_secs
        }
    }

    /// Per-batch timeout as a `Duration`, if enabled
    pub fn batch_timeout(&self) -> Option<Duration> {
        if self.batch_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.batch_timeout_ms))
        }
    }

    /// Trust buffer auto-flush interval
    pub fn trust_flush_interval(&self) -> Duration {
        Duration::from_millis(self.trust_flush_interval_ms)
    }

    /// Apply `RETRODICT_*` environment overrides on top of this config
    ///
    /// Environment wins over file values; run-submit arguments are applied
    /// by the caller afterwards and win over both. Unparseable values are
    /// rejected rather than silently ignored.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        fn parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
            match std::env::var(key) {
                Ok(raw) => raw.parse::<T>().map(Some).map_err(|_| {
                    RetrodictError::configuration(format!("cannot parse {}={:?}", key, raw))
                }),
                Err(_) => Ok(None),
            }
        }

        if let Some(v) = parse("RETRODICT_MAX_WORKERS")? {
            self.max_workers = v;
        }
        if let Some(v) = parse("RETRODICT_BATCH_WINDOW_SECS")? {
            self.batch_window_secs = v;
        }
        if let Some(v) = parse("RETRODICT_BATCH_STEP_SECS")? {
            self.batch_step_secs = v;
        }
        if let Some(v) = parse("RETRODICT_QUEUE_DEPTH")? {
            self.queue_depth = v;
        }
        if let Some(v) = parse("RETRODICT_BATCH_TIMEOUT_MS")? {
            self.batch_timeout_ms = v;
        }
        if let Some(v) = parse("RETRODICT_MAX_RETRIES")? {
            self.max_retries = v;
        }
        if let Some(v) = parse("RETRODICT_RETRY_BASE_DELAY_MS")? {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = parse("RETRODICT_MIN_SUCCESS_RATIO")? {
            self.min_success_ratio = v;
        }
        if let Some(v) = parse("RETRODICT_MIN_SAMPLE_BATCHES")? {
            self.min_sample_batches = v;
        }
        if let Some(v) = parse("RETRODICT_CACHE_BYTES")? {
            self.cache_bytes = v;
        }
        if let Some(v) = parse("RETRODICT_PREFETCH_BLOCKS")? {
            self.prefetch_blocks = v;
        }
        if let Some(v) = parse("RETRODICT_METRICS_QUEUE_SIZE")? {
            self.metrics_queue_size = v;
        }
        if let Some(v) = parse::<String>("RETRODICT_METRICS_DROP_POLICY")? {
            self.metrics_drop_policy = match v.as_str() {
                "drop_oldest" => MetricsDropPolicy::DropOldest,
                "block" => MetricsDropPolicy::Block,
                other => {
                    return Err(RetrodictError::configuration(format!(
                        "unknown metrics drop policy: {:?}",
                        other
                    )))
                }
            };
        }
        if let Some(v) = parse("RETRODICT_TRUST_FLUSH_THRESHOLD")? {
            self.trust_flush_threshold = v;
        }
        if let Some(v) = parse("RETRODICT_TRUST_FLUSH_INTERVAL_MS")? {
            self.trust_flush_interval_ms = v;
        }
        if let Some(v) = parse("RETRODICT_CHECKPOINT_INTERVAL_TURNS")? {
            self.checkpoint_interval_turns = v;
        }
        if let Some(v) = parse("RETRODICT_CURRICULUM_ENABLED")? {
            self.curriculum_enabled = v;
        }
        if let Some(v) = parse::<String>("RETRODICT_REMOTE_RESULTS_URI")? {
            self.remote_results_uri = if v.is_empty() { None } else { Some(v) };
        }
        Ok(self)
    }

    /// Validate the configuration; fatal at startup on failure
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(RetrodictError::configuration("max_workers must be >= 1"));
        }
        if self.batch_window_secs <= 0 {
            return Err(RetrodictError::configuration(
                "batch_window_secs must be positive",
            ));
        }
        if self.batch_step_secs < 0 {
            return Err(RetrodictError::configuration(
                "batch_step_secs must be non-negative",
            ));
        }
        if self.sample_interval_secs <= 0 {
            return Err(RetrodictError::configuration(
                "sample_interval_secs must be positive",
            ));
        }
        if self.queue_depth == 0 {
            return Err(RetrodictError::configuration("queue_depth must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.min_success_ratio) {
            return Err(RetrodictError::configuration(
                "min_success_ratio must be in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.overlay_decay_rate) {
            return Err(RetrodictError::configuration(
                "overlay_decay_rate must be in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.max_turn_abort_ratio) {
            return Err(RetrodictError::configuration(
                "max_turn_abort_ratio must be in [0, 1]",
            ));
        }
        if self.checkpoint_interval_turns == 0 {
            return Err(RetrodictError::configuration(
                "checkpoint_interval_turns must be >= 1",
            ));
        }
        if self.initial_cash < 0.0 || !self.initial_cash.is_finite() {
            return Err(RetrodictError::configuration(
                "initial_cash must be non-negative",
            ));
        }
        if self.stream_batch_rows == 0 {
            return Err(RetrodictError::configuration(
                "stream_batch_rows must be >= 1",
            ));
        }
        Ok(())
    }
}
