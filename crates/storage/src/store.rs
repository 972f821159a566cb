//! The streaming data store
//!
//! Composes the backend fallback chain (columnar → row → object store),
//! the byte-budget block cache, and the prefetch executor behind the
//! row-provider interface workers consume.
//!
//! ## Sharing model
//!
//! The store is shared read-only across all workers of a run. The cache
//! lock is separate from backend I/O, so cache readers never block on a
//! disk read. `close()` terminates the prefetch worker with
//! wait-for-completion semantics before returning.

use crate::backend::StorageBackend;
use crate::block::{BackendKind, BlockMeta, RowBlock, RowFilter};
use crate::cache::{BlockCache, CacheKey};
use crate::columnar::ColumnarBackend;
use crate::manifest::DatasetManifest;
use crate::object::{ObjectBackend, ObjectStoreClient};
use crate::prefetch::{Prefetcher, PrefetchRequest};
use crate::rowfile::RowBackend;
use parking_lot::RwLock;
use retrodict_core::{RetrodictError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store configuration
#[derive(Clone)]
pub struct StoreConfig {
    /// Root directory for local backends
    pub root: PathBuf,
    /// Cache byte budget
    pub cache_bytes: usize,
    /// Prefetch depth, in blocks; zero disables read-ahead
    pub prefetch_blocks: usize,
    /// `retrieve` returns a full block up to this many rows, a stream above
    pub eager_row_limit: usize,
}

impl StoreConfig {
    /// Config rooted at `root` with default bounds
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            cache_bytes: 256 * 1024 * 1024,
            prefetch_blocks: 4,
            eager_row_limit: 65_536,
        }
    }
}

/// Observability counters for the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreStats {
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Cache evictions
    pub cache_evictions: u64,
    /// Reads that fell through past the first containing backend
    pub fallthroughs: u64,
    /// Completed background read-aheads
    pub prefetch_completed: u64,
    /// Current resident cache bytes
    pub resident_bytes: usize,
}

/// Result of `retrieve`: a full block or a stream
#[derive(Debug)]
pub enum Retrieved {
    /// Whole dataset, small enough to materialize
    Full(Arc<RowBlock>, BlockMeta),
    /// Streamed access for larger datasets
    Streamed(BlockStream),
}

struct StoreInner {
    config: StoreConfig,
    backends: Vec<Arc<dyn StorageBackend>>,
    cache: Arc<BlockCache>,
    prefetcher: Prefetcher,
    fallthroughs: AtomicU64,
    closed: RwLock<bool>,
}

/// Bounded-memory, prefetching row provider with backend fallback
pub struct DataStore {
    inner: Arc<StoreInner>,
}

impl DataStore {
    /// Open a store over the default backend chain
    ///
    /// Columnar and row backends share the dataset directories under
    /// `config.root`; the object backend joins the chain when a client is
    /// provided.
    pub fn open(config: StoreConfig, remote: Option<Box<dyn ObjectStoreClient>>) -> Result<Self> {
        let mut backends: Vec<Arc<dyn StorageBackend>> = vec![
            Arc::new(ColumnarBackend::new(&config.root)),
            Arc::new(RowBackend::new(&config.root)),
        ];
        if let Some(client) = remote {
            backends.push(Arc::new(ObjectBackend::new(client)));
        }
        Self::with_backends(config, backends)
    }

    /// Open a store over an explicit backend chain
    ///
    /// First backend is primary; later entries are fallbacks in order.
    pub fn with_backends(
        config: StoreConfig,
        backends: Vec<Arc<dyn StorageBackend>>,
    ) -> Result<Self> {
        if backends.is_empty() {
            return Err(RetrodictError::configuration(
                "data store needs at least one backend",
            ));
        }
        let cache = Arc::new(BlockCache::new(config.cache_bytes));

        let resolver_backends = backends.clone();
        let resolver: crate::prefetch::BackendResolver = Arc::new(move |dataset: &str| {
            resolver_backends
                .iter()
                .find(|b| b.contains(dataset))
                .cloned()
        });
        let prefetcher = Prefetcher::new(resolver, Arc::clone(&cache), config.prefetch_blocks);

        info!(
            target: "retrodict::storage",
            backends = backends.len(),
            cache_bytes = config.cache_bytes,
            "data store opened"
        );
        Ok(DataStore {
            inner: Arc::new(StoreInner {
                config,
                backends,
                cache,
                prefetcher,
                fallthroughs: AtomicU64::new(0),
                closed: RwLock::new(false),
            }),
        })
    }

    fn check_open(&self) -> Result<()> {
        if *self.inner.closed.read() {
            return Err(RetrodictError::invariant("data store is closed"));
        }
        Ok(())
    }

    /// Load the manifest of a dataset from the first backend that has it
    pub fn manifest(&self, dataset_id: &str) -> Result<DatasetManifest> {
        self.check_open()?;
        for backend in &self.inner.backends {
            if backend.contains(dataset_id) {
                return backend.manifest(dataset_id);
            }
        }
        Err(RetrodictError::not_found(dataset_id))
    }

    /// Read a row range, falling through the backend chain on failure
    fn read_with_fallback(
        &self,
        dataset_id: &str,
        range: Option<(usize, usize)>,
    ) -> Result<(RowBlock, BackendKind)> {
        let mut containing = 0;
        let mut last_error: Option<RetrodictError> = None;
        for backend in &self.inner.backends {
            if !backend.contains(dataset_id) {
                continue;
            }
            containing += 1;
            match backend.read_rows(dataset_id, range) {
                Ok(block) => {
                    if containing > 1 {
                        self.inner.fallthroughs.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok((block, backend.kind()));
                }
                Err(e) => {
                    warn!(
                        target: "retrodict::storage",
                        dataset = dataset_id,
                        backend = %backend.kind(),
                        error = %e,
                        "backend read failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }
        if containing == 0 {
            Err(RetrodictError::not_found(dataset_id))
        } else {
            Err(RetrodictError::backend_unavailable(
                dataset_id,
                last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no backend served the read".to_string()),
            ))
        }
    }

    /// Retrieve a dataset: full block when small, a stream otherwise
    pub fn retrieve(&self, dataset_id: &str) -> Result<Retrieved> {
        self.check_open()?;
        let manifest = self.manifest(dataset_id)?;
        if manifest.row_count <= self.inner.config.eager_row_limit {
            let key = CacheKey {
                dataset_id: dataset_id.to_string(),
                start_row: 0,
                end_row: manifest.row_count,
            };
            if let Some((block, meta)) = self.inner.cache.get(&key) {
                return Ok(Retrieved::Full(block, meta));
            }
            let (block, source) = self.read_with_fallback(dataset_id, None)?;
            let meta = BlockMeta {
                dataset_id: dataset_id.to_string(),
                source,
                start_row: 0,
                row_count: block.row_count(),
                byte_size: block.byte_size(),
            };
            let block = Arc::new(block);
            self.inner
                .cache
                .insert(key, Arc::clone(&block), meta.clone());
            Ok(Retrieved::Full(block, meta))
        } else {
            Ok(Retrieved::Streamed(self.stream(
                dataset_id,
                RowFilter::default(),
                self.inner.config.eager_row_limit.max(1),
            )?))
        }
    }

    /// Stream a dataset in blocks of at most `batch_size` rows
    ///
    /// Finite and not restartable. Time filters are pushed down to the
    /// backend when supported, otherwise applied in-process per block
    /// without materializing the dataset. A decode failure corrupts only
    /// the offending block; the iterator continues past it.
    pub fn stream(
        &self,
        dataset_id: &str,
        filter: RowFilter,
        batch_size: usize,
    ) -> Result<BlockStream> {
        self.check_open()?;
        if batch_size == 0 {
            return Err(RetrodictError::configuration("batch_size must be >= 1"));
        }
        let manifest = self.manifest(dataset_id)?;

        // Resolve the row window up front via pushdown where the serving
        // backend supports it.
        let serving = self
            .inner
            .backends
            .iter()
            .find(|b| b.contains(dataset_id))
            .cloned()
            .ok_or_else(|| RetrodictError::not_found(dataset_id))?;

        let (start_row, end_row, pushed_down) = match (&filter.start, &filter.end) {
            (Some(start), Some(end)) if serving.supports_time_pushdown() => {
                match serving.row_range_for_time(dataset_id, *start, *end) {
                    Ok((lo, hi)) => (lo, hi, true),
                    Err(_) => (0, manifest.row_count, false),
                }
            }
            _ => (0, manifest.row_count, false),
        };

        debug!(
            target: "retrodict::storage",
            dataset = dataset_id,
            rows = end_row - start_row,
            pushed_down,
            "stream opened"
        );
        Ok(BlockStream {
            store: DataStore {
                inner: Arc::clone(&self.inner),
            },
            dataset_id: dataset_id.to_string(),
            filter,
            pushed_down,
            batch_size,
            next_row: start_row,
            end_row,
        })
    }

    /// Persist a block with caller metadata; atomic from the caller's view
    ///
    /// Writes go to the primary backend. Any cached ranges for the dataset
    /// become stale and are dropped wholesale.
    pub fn store(
        &self,
        dataset_id: &str,
        block: &RowBlock,
        extra: BTreeMap<String, String>,
    ) -> Result<DatasetManifest> {
        self.check_open()?;
        let manifest = self.inner.backends[0].write(dataset_id, block, &extra)?;
        self.inner.cache.clear();
        Ok(manifest)
    }

    /// Observability snapshot
    pub fn stats(&self) -> StoreStats {
        let (hits, misses, evictions) = self.inner.cache.counters();
        StoreStats {
            cache_hits: hits,
            cache_misses: misses,
            cache_evictions: evictions,
            fallthroughs: self.inner.fallthroughs.load(Ordering::Relaxed),
            prefetch_completed: self.inner.prefetcher.completed(),
            resident_bytes: self.inner.cache.resident_bytes(),
        }
    }

    /// Current resident cache bytes (always within budget)
    pub fn resident_bytes(&self) -> usize {
        self.inner.cache.resident_bytes()
    }

    /// Close the store: stop prefetching, drop the cache
    ///
    /// Terminates the prefetch worker with wait-for-completion semantics
    /// and releases cache memory before returning. Subsequent operations
    /// fail.
    pub fn close(&self) -> Result<()> {
        {
            let mut closed = self.inner.closed.write();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        self.inner.prefetcher.close();
        self.inner.cache.clear();
        info!(target: "retrodict::storage", "data store closed");
        Ok(())
    }
}

impl Clone for DataStore {
    fn clone(&self) -> Self {
        DataStore {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Finite, non-restartable block iterator over one dataset
pub struct BlockStream {
    store: DataStore,
    dataset_id: String,
    filter: RowFilter,
    pushed_down: bool,
    batch_size: usize,
    next_row: usize,
    end_row: usize,
}

impl std::fmt::Debug for BlockStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStream")
            .field("dataset_id", &self.dataset_id)
            .field("filter", &self.filter)
            .field("pushed_down", &self.pushed_down)
            .field("batch_size", &self.batch_size)
            .field("next_row", &self.next_row)
            .field("end_row", &self.end_row)
            .finish()
    }
}

impl BlockStream {
    /// Rows remaining in the stream window
    pub fn remaining_rows(&self) -> usize {
        self.end_row.saturating_sub(self.next_row)
    }
}

impl Iterator for BlockStream {
    type Item = Result<(Arc<RowBlock>, BlockMeta)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row >= self.end_row {
            return None;
        }
        let start = self.next_row;
        let end = (start + self.batch_size).min(self.end_row);
        // Advance the cursor before decoding so a corrupt block never
        // wedges the iterator.
        self.next_row = end;

        // Read ahead one block past this one.
        if end < self.end_row {
            let ahead_end = (end + self.batch_size).min(self.end_row);
            self.store.inner.prefetcher.request(PrefetchRequest {
                dataset_id: self.dataset_id.clone(),
                start_row: end,
                end_row: ahead_end,
            });
        }

        let key = CacheKey {
            dataset_id: self.dataset_id.clone(),
            start_row: start,
            end_row: end,
        };
        let (block, meta) = match self.store.inner.cache.get(&key) {
            Some((block, meta)) => (block, meta),
            None => match self.store.read_with_fallback(&self.dataset_id, Some((start, end))) {
                Ok((block, source)) => {
                    let meta = BlockMeta {
                        dataset_id: self.dataset_id.clone(),
                        source,
                        start_row: start,
                        row_count: block.row_count(),
                        byte_size: block.byte_size(),
                    };
                    let block = Arc::new(block);
                    self.store
                        .inner
                        .cache
                        .insert(key, Arc::clone(&block), meta.clone());
                    (block, meta)
                }
                Err(e) => return Some(Err(e)),
            },
        };

        // Residual filtering: projection always runs in-process; time
        // bounds only when the backend could not push them down.
        let needs_time_filter =
            !self.pushed_down && (self.filter.start.is_some() || self.filter.end.is_some());
        let needs_projection = self.filter.columns.is_some();
        if needs_time_filter || needs_projection {
            let residual = if needs_time_filter {
                self.filter.apply(&block)
            } else {
                match &self.filter.columns {
                    Some(names) => block.project(names),
                    None => (*block).clone(),
                }
            };
            let meta = BlockMeta {
                row_count: residual.row_count(),
                byte_size: residual.byte_size(),
                ..meta
            };
            return Some(Ok((Arc::new(residual), meta)));
        }

        Some(Ok((block, meta)))
    }
}
