//! Background prefetch executor
//!
//! A single drain task reads row ranges ahead of the stream cursor and
//! populates the block cache. Depth is bounded: requests beyond the bound
//! are dropped, since read-ahead is best effort. `close()` has
//! wait-for-completion semantics: it returns only after the worker has
//! finished any in-flight read and exited.

use crate::backend::StorageBackend;
use crate::block::BlockMeta;
use crate::cache::{BlockCache, CacheKey};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{trace, warn};

/// A read-ahead request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchRequest {
    /// Dataset to read from
    pub dataset_id: String,
    /// Row range to load
    pub start_row: usize,
    /// One past the last row
    pub end_row: usize,
}

/// Resolves the serving backend for a dataset at read time
///
/// The store passes its fallback-chain resolution here so prefetched
/// blocks carry the same `source` tag a demand read would.
pub type BackendResolver =
    Arc<dyn Fn(&str) -> Option<Arc<dyn StorageBackend>> + Send + Sync>;

/// Queue plus in-flight flag, guarded together so idleness is a single
/// consistent observation
struct PrefetchState {
    queue: VecDeque<PrefetchRequest>,
    busy: bool,
}

struct PrefetchInner {
    state: Mutex<PrefetchState>,
    work_ready: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    completed: AtomicU64,
    dropped: AtomicU64,
}

/// Bounded single-worker prefetcher
pub struct Prefetcher {
    inner: Arc<PrefetchInner>,
    depth: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Prefetcher {
    /// Start the prefetch worker
    ///
    /// Reads are best effort; a failed or unresolvable read-ahead just
    /// means the stream pays the read on demand.
    pub fn new(resolver: BackendResolver, cache: Arc<BlockCache>, depth: usize) -> Self {
        let inner = Arc::new(PrefetchInner {
            state: Mutex::new(PrefetchState {
                queue: VecDeque::new(),
                busy: false,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("retrodict-prefetch".to_string())
            .spawn(move || prefetch_loop(&worker_inner, resolver, cache))
            .expect("failed to spawn prefetch worker thread");

        Prefetcher {
            inner,
            depth,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a read-ahead request; dropped when the queue is at depth
    ///
    /// A depth of zero disables read-ahead entirely.
    pub fn request(&self, request: PrefetchRequest) {
        let mut state = self.inner.state.lock();
        if state.queue.len() >= self.depth {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(target: "retrodict::storage", "prefetch queue full, request dropped");
            return;
        }
        if state.queue.contains(&request) {
            return;
        }
        state.queue.push_back(request);
        self.inner.work_ready.notify_one();
    }

    /// Completed read-ahead count
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Dropped request count (queue at depth)
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Block until the queue is empty and the worker is idle
    pub fn wait_idle(&self) {
        let mut state = self.inner.state.lock();
        while !(state.queue.is_empty() && !state.busy) {
            self.inner.idle.wait(&mut state);
        }
    }

    /// Shut down with wait-for-completion semantics
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.work_ready.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(target: "retrodict::storage", "prefetch worker panicked during close");
            }
        }
        // Release anyone parked in wait_idle; the worker is gone.
        self.inner.idle.notify_all();
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.work_ready.notify_all();
    }
}

fn prefetch_loop(inner: &Arc<PrefetchInner>, resolver: BackendResolver, cache: Arc<BlockCache>) {
    loop {
        let request = {
            let mut state = inner.state.lock();
            loop {
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(req) = state.queue.pop_front() {
                    state.busy = true;
                    break req;
                }
                inner.idle.notify_all();
                inner.work_ready.wait(&mut state);
            }
        };

        let key = CacheKey {
            dataset_id: request.dataset_id.clone(),
            start_row: request.start_row,
            end_row: request.end_row,
        };
        if cache.get(&key).is_none() {
            let Some(backend) = resolver(&request.dataset_id) else {
                let mut state = inner.state.lock();
                state.busy = false;
                if state.queue.is_empty() {
                    inner.idle.notify_all();
                }
                continue;
            };
            match backend.read_rows(&request.dataset_id, Some((request.start_row, request.end_row)))
            {
                Ok(block) => {
                    let meta = BlockMeta {
                        dataset_id: request.dataset_id.clone(),
                        source: backend.kind(),
                        start_row: request.start_row,
                        row_count: block.row_count(),
                        byte_size: block.byte_size(),
                    };
                    cache.insert(key, Arc::new(block), meta);
                    inner.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    // Best effort: the stream retries on demand and
                    // surfaces the error with full context.
                    trace!(target: "retrodict::storage", error = %e, "prefetch read failed");
                }
            }
        }

        let mut state = inner.state.lock();
        state.busy = false;
        if state.queue.is_empty() {
            inner.idle.notify_all();
        }
    }
}
