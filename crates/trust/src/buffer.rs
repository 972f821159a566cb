//! Trust update buffer
//!
//! Decouples hot-path workers from shard-lock acquisition: outcomes are
//! aggregated per rule in an in-memory map and flushed to the tracker when
//! the buffer grows past `flush_threshold`, when the oldest entry exceeds
//! `auto_flush_interval`, or on `close()`. Loss is possible only on hard
//! crash; `close()` drains synchronously.

use crate::tracker::{TrustDelta, TrustTracker};
use parking_lot::{Condvar, Mutex};
use retrodict_core::RuleId;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Buffer configuration
#[derive(Debug, Clone)]
pub struct TrustBufferConfig {
    /// Flush when this many distinct rules have pending deltas
    pub flush_threshold: usize,
    /// Flush when the oldest pending delta is this old
    pub auto_flush_interval: Duration,
}

impl Default for TrustBufferConfig {
    fn default() -> Self {
        TrustBufferConfig {
            flush_threshold: 256,
            auto_flush_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Default)]
struct Pending {
    // rule -> (successes, failures), aggregated before flush to minimize
    // shard contention
    deltas: FxHashMap<RuleId, (u64, u64)>,
    oldest: Option<Instant>,
    max_turn: u64,
}

struct BufferInner {
    pending: Mutex<Pending>,
    wake: Condvar,
    shutdown: AtomicBool,
    flushes: AtomicU64,
}

/// Shared write-many buffer in front of the trust tracker
pub struct TrustBuffer {
    inner: Arc<BufferInner>,
    tracker: Arc<TrustTracker>,
    config: TrustBufferConfig,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl TrustBuffer {
    /// Create a buffer and start its background flusher
    pub fn new(tracker: Arc<TrustTracker>, config: TrustBufferConfig) -> Arc<Self> {
        let inner = Arc::new(BufferInner {
            pending: Mutex::new(Pending::default()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            flushes: AtomicU64::new(0),
        });

        let buffer = Arc::new(TrustBuffer {
            inner: Arc::clone(&inner),
            tracker: Arc::clone(&tracker),
            config: config.clone(),
            flusher: Mutex::new(None),
        });

        let handle = std::thread::Builder::new()
            .name("retrodict-trust-flush".to_string())
            .spawn(move || {
                flusher_loop(&inner, &tracker, &config);
            })
            .expect("failed to spawn trust flusher thread");
        *buffer.flusher.lock() = Some(handle);
        buffer
    }

    /// Record one outcome; non-blocking aggregation
    pub fn enqueue(&self, rule_id: &RuleId, outcome: bool, turn: u64) {
        let mut pending = self.inner.pending.lock();
        let entry = pending.deltas.entry(rule_id.clone()).or_insert((0, 0));
        if outcome {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
        pending.oldest.get_or_insert_with(Instant::now);
        pending.max_turn = pending.max_turn.max(turn);
        if pending.deltas.len() >= self.config.flush_threshold {
            self.inner.wake.notify_one();
        }
    }

    /// Record pre-aggregated per-batch deltas
    pub fn enqueue_batch(&self, deltas: &[TrustDelta], turn: u64) {
        if deltas.is_empty() {
            return;
        }
        let mut pending = self.inner.pending.lock();
        for (rule_id, successes, failures) in deltas {
            let entry = pending.deltas.entry(rule_id.clone()).or_insert((0, 0));
            entry.0 += successes;
            entry.1 += failures;
        }
        pending.oldest.get_or_insert_with(Instant::now);
        pending.max_turn = pending.max_turn.max(turn);
        if pending.deltas.len() >= self.config.flush_threshold {
            self.inner.wake.notify_one();
        }
    }

    /// Drain everything pending into the tracker
    pub fn flush(&self) {
        drain(&self.inner, &self.tracker);
    }

    /// Number of background flushes performed so far
    pub fn flush_count(&self) -> u64 {
        self.inner.flushes.load(Ordering::Relaxed)
    }

    /// Synchronous close: fully drains, then joins the flusher
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
        if let Some(handle) = self.flusher.lock().take() {
            if handle.join().is_err() {
                warn!(target: "retrodict::trust", "trust flusher panicked during close");
            }
        }
        // Final drain in case anything raced the flusher's exit.
        drain(&self.inner, &self.tracker);
    }
}

impl Drop for TrustBuffer {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_all();
    }
}

fn drain(inner: &BufferInner, tracker: &TrustTracker) {
    let (deltas, turn) = {
        let mut pending = inner.pending.lock();
        if pending.deltas.is_empty() {
            return;
        }
        let drained: Vec<TrustDelta> = pending
            .deltas
            .drain()
            .map(|(id, (s, f))| (id, s, f))
            .collect();
        pending.oldest = None;
        (drained, pending.max_turn)
    };
    tracker.batch_update(&deltas, turn);
    inner.flushes.fetch_add(1, Ordering::Relaxed);
    debug!(target: "retrodict::trust", rules = deltas.len(), "trust buffer flushed");
}

fn flusher_loop(inner: &Arc<BufferInner>, tracker: &Arc<TrustTracker>, config: &TrustBufferConfig) {
    loop {
        {
            let mut pending = inner.pending.lock();
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let should_flush = pending.deltas.len() >= config.flush_threshold
                || pending
                    .oldest
                    .map(|t| t.elapsed() >= config.auto_flush_interval)
                    .unwrap_or(false);
            if !should_flush {
                inner
                    .wake
                    .wait_for(&mut pending, config.auto_flush_interval);
                continue;
            }
        }
        drain(inner, tracker);
    }
    // Shutdown path: leave the final drain to close().
}
