//! Byte-budget block cache
//!
//! Bounds resident blocks by total bytes rather than entry count. Eviction
//! is O(1): entries live in a slab-backed doubly-linked recency list, with
//! a hash map from key to slab index. The cache lock is separate from
//! backend I/O, so readers hitting the cache never block on a disk read.

use crate::block::{BlockMeta, RowBlock};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Cache key: a contiguous row range of one dataset
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Dataset id
    pub dataset_id: String,
    /// First row of the cached range
    pub start_row: usize,
    /// One past the last row of the cached range
    pub end_row: usize,
}

struct Node {
    key: CacheKey,
    block: Arc<RowBlock>,
    meta: BlockMeta,
    bytes: usize,
    prev: usize,
    next: usize,
}

const NIL: usize = usize::MAX;

struct CacheInner {
    map: FxHashMap<CacheKey, usize>,
    slab: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    resident_bytes: usize,
}

impl CacheInner {
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slab[idx].as_ref().expect("detached node exists");
            (node.prev, node.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.slab[p].as_mut().expect("prev node exists").next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.slab[n].as_mut().expect("next node exists").prev = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        {
            let node = self.slab[idx].as_mut().expect("pushed node exists");
            node.prev = NIL;
            node.next = self.head;
        }
        if self.head != NIL {
            self.slab[self.head].as_mut().expect("head exists").prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn pop_tail(&mut self) -> Option<Node> {
        if self.tail == NIL {
            return None;
        }
        let idx = self.tail;
        self.detach(idx);
        let node = self.slab[idx].take().expect("tail node exists");
        self.free.push(idx);
        self.map.remove(&node.key);
        self.resident_bytes -= node.bytes;
        Some(node)
    }
}

/// LRU block cache with an enforced byte budget
pub struct BlockCache {
    inner: Mutex<CacheInner>,
    budget_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCache {
    /// Create a cache bounded by `budget_bytes`
    pub fn new(budget_bytes: usize) -> Self {
        BlockCache {
            inner: Mutex::new(CacheInner {
                map: FxHashMap::default(),
                slab: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                resident_bytes: 0,
            }),
            budget_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a cached range, refreshing its recency
    pub fn get(&self, key: &CacheKey) -> Option<(Arc<RowBlock>, BlockMeta)> {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.map.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        inner.detach(idx);
        inner.push_front(idx);
        let node = inner.slab[idx].as_ref().expect("hit node exists");
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some((Arc::clone(&node.block), node.meta.clone()))
    }

    /// Insert a block, evicting from the cold end to stay within budget
    ///
    /// A block larger than the whole budget is not cached at all; the
    /// bound is enforced at every observable moment, not amortized.
    pub fn insert(&self, key: CacheKey, block: Arc<RowBlock>, meta: BlockMeta) {
        let bytes = block.byte_size();
        if bytes > self.budget_bytes {
            trace!(target: "retrodict::storage", bytes, "block exceeds cache budget, not cached");
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.map.get(&key) {
            inner.detach(idx);
            let old = inner.slab[idx].take().expect("replaced node exists");
            inner.free.push(idx);
            inner.map.remove(&old.key);
            inner.resident_bytes -= old.bytes;
        }
        while inner.resident_bytes + bytes > self.budget_bytes {
            if inner.pop_tail().is_none() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let node = Node {
            key: key.clone(),
            block,
            meta,
            bytes,
            prev: NIL,
            next: NIL,
        };
        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.slab[idx] = Some(node);
                idx
            }
            None => {
                inner.slab.push(Some(node));
                inner.slab.len() - 1
            }
        };
        inner.map.insert(key, idx);
        inner.push_front(idx);
        inner.resident_bytes += bytes;
    }

    /// Current resident bytes
    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().resident_bytes
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached block
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.slab.clear();
        inner.free.clear();
        inner.head = NIL;
        inner.tail = NIL;
        inner.resident_bytes = 0;
    }

    /// (hits, misses, evictions) counters
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
        )
    }
}
