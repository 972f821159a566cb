//! Test helpers for exercising backend failure paths
//!
//! `FlakyBackend` wraps any backend and fails a configured number of reads
//! before recovering, which is how fallback and retry paths get exercised
//! without real hardware faults.

use crate::backend::StorageBackend;
use crate::block::{BackendKind, RowBlock};
use crate::manifest::DatasetManifest;
use retrodict_core::{RetrodictError, Result, Timestamp};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Backend wrapper that fails the first N reads
pub struct FlakyBackend {
    inner: Arc<dyn StorageBackend>,
    failures_remaining: AtomicU32,
}

impl FlakyBackend {
    /// Wrap `inner`, failing its first `failures` reads
    pub fn new(inner: Arc<dyn StorageBackend>, failures: u32) -> Self {
        FlakyBackend {
            inner,
            failures_remaining: AtomicU32::new(failures),
        }
    }

    fn should_fail(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Reads that will still fail
    pub fn failures_remaining(&self) -> u32 {
        self.failures_remaining.load(Ordering::SeqCst)
    }
}

impl StorageBackend for FlakyBackend {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    fn contains(&self, dataset_id: &str) -> bool {
        self.inner.contains(dataset_id)
    }

    fn manifest(&self, dataset_id: &str) -> Result<DatasetManifest> {
        self.inner.manifest(dataset_id)
    }

    fn read_rows(&self, dataset_id: &str, range: Option<(usize, usize)>) -> Result<RowBlock> {
        if self.should_fail() {
            return Err(RetrodictError::transient(format!(
                "injected read failure for {}",
                dataset_id
            )));
        }
        self.inner.read_rows(dataset_id, range)
    }

    fn supports_time_pushdown(&self) -> bool {
        self.inner.supports_time_pushdown()
    }

    fn row_range_for_time(
        &self,
        dataset_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<(usize, usize)> {
        self.inner.row_range_for_time(dataset_id, start, end)
    }

    fn write(
        &self,
        dataset_id: &str,
        block: &RowBlock,
        extra: &BTreeMap<String, String>,
    ) -> Result<DatasetManifest> {
        self.inner.write(dataset_id, block, extra)
    }
}
