//! Asynchronous metrics collector
//!
//! `submit` is non-blocking and returns immediately; a single background
//! worker drains a bounded queue to the sink. When the queue is full the
//! drop policy decides: `DropOldest` sheds the oldest metric and counts
//! it, `Block` waits for space. Sink failures are retried on a bounded
//! exponential backoff schedule; the registered error callback fires
//! exactly once per metric that fails permanently.

use parking_lot::{Condvar, Mutex};
use retrodict_core::{now_millis, MetricsDropPolicy, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// One metric measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Metric name
    pub name: String,
    /// Measured value
    pub value: f64,
    /// Submission time, milliseconds since epoch
    ///
    /// The authoritative order across submitters.
    pub timestamp_ms: u64,
    /// Free-form labels
    pub labels: BTreeMap<String, String>,
}

impl MetricRecord {
    /// A measurement stamped now
    pub fn now(name: impl Into<String>, value: f64) -> Self {
        MetricRecord {
            name: name.into(),
            value,
            timestamp_ms: now_millis(),
            labels: BTreeMap::new(),
        }
    }

    /// Builder-style label attachment
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Destination for drained metrics
pub trait MetricsSink: Send + Sync {
    /// Emit one metric; failures are retried by the collector
    fn emit(&self, record: &MetricRecord) -> Result<()>;
}

/// Callback invoked once per permanently failed metric
pub type MetricErrorCallback = Box<dyn Fn(&MetricRecord, &str) + Send + Sync>;

/// Collector configuration
pub struct MetricsConfig {
    /// Queue bound
    pub queue_size: usize,
    /// Full-queue behavior
    pub drop_policy: MetricsDropPolicy,
    /// Retry attempts per metric before giving up
    pub max_retries: u32,
    /// Base delay of the exponential backoff schedule
    pub retry_base_delay: Duration,
    /// Close flush deadline
    pub close_timeout: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            queue_size: 4096,
            drop_policy: MetricsDropPolicy::DropOldest,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

struct CollectorInner {
    queue: Mutex<VecDeque<MetricRecord>>,
    work_ready: Condvar,
    space_ready: Condvar,
    drained: Condvar,
    shutdown: AtomicBool,
    dropped: AtomicU64,
    emitted: AtomicU64,
    failed: AtomicU64,
    unflushed: AtomicU64,
}

/// Non-blocking metrics front end with a single background drain task
pub struct MetricsCollector {
    inner: Arc<CollectorInner>,
    config: MetricsConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsCollector {
    /// Start the collector over a sink
    pub fn new(
        sink: Arc<dyn MetricsSink>,
        config: MetricsConfig,
        on_error: Option<MetricErrorCallback>,
    ) -> Self {
        let inner = Arc::new(CollectorInner {
            queue: Mutex::new(VecDeque::new()),
            work_ready: Condvar::new(),
            space_ready: Condvar::new(),
            drained: Condvar::new(),
            shutdown: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            unflushed: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let max_retries = config.max_retries;
        let base_delay = config.retry_base_delay;
        let handle = std::thread::Builder::new()
            .name("retrodict-metrics".to_string())
            .spawn(move || {
                drain_loop(&worker_inner, sink, on_error, max_retries, base_delay);
            })
            .expect("failed to spawn metrics worker thread");

        MetricsCollector {
            inner,
            config,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Submit a metric without blocking on I/O
    ///
    /// Latency is bounded by the queue lock only and does not scale with
    /// queue depth. Under `DropOldest` the call never waits; under `Block`
    /// it waits for queue space (the one deliberate exception).
    pub fn submit(&self, record: MetricRecord) {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.config.queue_size {
            match self.config.drop_policy {
                MetricsDropPolicy::DropOldest => {
                    queue.pop_front();
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
                MetricsDropPolicy::Block => {
                    while queue.len() >= self.config.queue_size
                        && !self.inner.shutdown.load(Ordering::SeqCst)
                    {
                        self.inner.space_ready.wait(&mut queue);
                    }
                }
            }
        }
        queue.push_back(record);
        self.inner.work_ready.notify_one();
    }

    /// Metrics shed by the load-shedding policy
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Metrics successfully emitted to the sink
    pub fn emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    /// Metrics that permanently failed after retries
    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Metrics still queued when close gave up
    pub fn unflushed(&self) -> u64 {
        self.inner.unflushed.load(Ordering::Relaxed)
    }

    /// Flush within the configured timeout, then stop the worker
    ///
    /// Metrics still queued at the deadline are counted as unflushed and
    /// not retried.
    pub fn close(&self) {
        {
            let mut queue = self.inner.queue.lock();
            let deadline = std::time::Instant::now() + self.config.close_timeout;
            while !queue.is_empty() {
                let now = std::time::Instant::now();
                if now >= deadline {
                    let left = queue.len() as u64;
                    self.inner.unflushed.fetch_add(left, Ordering::Relaxed);
                    queue.clear();
                    warn!(target: "retrodict::metrics", unflushed = left, "close timeout, metrics discarded");
                    break;
                }
                self.inner.work_ready.notify_one();
                self.inner.drained.wait_for(&mut queue, deadline - now);
            }
        }
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.work_ready.notify_all();
        self.inner.space_ready.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(target: "retrodict::metrics", "metrics worker panicked during close");
            }
        }
    }
}

impl Drop for MetricsCollector {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.work_ready.notify_all();
        self.inner.space_ready.notify_all();
    }
}

fn drain_loop(
    inner: &Arc<CollectorInner>,
    sink: Arc<dyn MetricsSink>,
    on_error: Option<MetricErrorCallback>,
    max_retries: u32,
    base_delay: Duration,
) {
    loop {
        let record = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(record) = queue.pop_front() {
                    inner.space_ready.notify_one();
                    break record;
                }
                inner.drained.notify_all();
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let mut attempt = 0;
        loop {
            match sink.emit(&record) {
                Ok(()) => {
                    inner.emitted.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) if attempt < max_retries => {
                    // capped exponential backoff between attempts
                    let delay = base_delay * 2u32.saturating_pow(attempt);
                    debug!(target: "retrodict::metrics", error = %e, attempt, "sink emit failed, retrying");
                    std::thread::sleep(delay.min(Duration::from_secs(1)));
                    attempt += 1;
                }
                Err(e) => {
                    inner.failed.fetch_add(1, Ordering::Relaxed);
                    if let Some(cb) = &on_error {
                        cb(&record, &e.to_string());
                    }
                    break;
                }
            }
        }
    }
}
