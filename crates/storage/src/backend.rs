//! Storage backend abstraction
//!
//! The store composes a fallback chain of backends: columnar (memory
//! mapped) first, then row-oriented files, then a remote object store. A
//! request tries the first backend that has the dataset and falls through
//! on unavailability; `BackendUnavailable` is surfaced only when every
//! backend fails.

use crate::block::{BackendKind, RowBlock};
use crate::manifest::DatasetManifest;
use retrodict_core::{Result, Timestamp};

/// A single storage backend in the fallback chain
pub trait StorageBackend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Whether the dataset exists on this backend
    fn contains(&self, dataset_id: &str) -> bool;

    /// Load the dataset manifest
    fn manifest(&self, dataset_id: &str) -> Result<DatasetManifest>;

    /// Read a contiguous row range; `None` reads all rows
    fn read_rows(&self, dataset_id: &str, range: Option<(usize, usize)>) -> Result<RowBlock>;

    /// Whether time filters can be resolved without decoding columns
    fn supports_time_pushdown(&self) -> bool {
        false
    }

    /// Resolve a half-open time window to a row range
    ///
    /// Only called when `supports_time_pushdown()` is true.
    fn row_range_for_time(
        &self,
        dataset_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<(usize, usize)> {
        let _ = (dataset_id, start, end);
        Err(retrodict_core::RetrodictError::internal(
            "backend does not support time pushdown",
        ))
    }

    /// Persist a block and its manifest; atomic from the caller's view
    ///
    /// `extra` is caller-supplied metadata recorded in the manifest.
    fn write(
        &self,
        dataset_id: &str,
        block: &RowBlock,
        extra: &std::collections::BTreeMap<String, String>,
    ) -> Result<DatasetManifest>;
}
