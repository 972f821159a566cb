//! Row-oriented fallback backend
//!
//! Stores a dataset as one zstd-compressed, bincode-encoded file of rows.
//! No random access: reads decode the whole file, so filters are applied
//! in-process by the store. This is the fallback when columnar data is
//! unavailable, and the payload format for the object-store backend.

use crate::backend::StorageBackend;
use crate::block::{BackendKind, RowBlock};
use crate::manifest::DatasetManifest;
use retrodict_core::{RetrodictError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const ROW_FILE: &str = "rows.bin.zst";
/// zstd level balancing ratio against worker-path decode cost
const COMPRESSION_LEVEL: i32 = 3;

/// Serialized row-file payload
#[derive(Debug, Serialize, Deserialize)]
struct RowFileData {
    column_names: Vec<String>,
    /// (timestamp, values aligned with column_names)
    rows: Vec<(i64, Vec<f64>)>,
}

/// Encode a block into the row payload format
///
/// Shared with the object-store backend, which ships the same bytes.
pub(crate) fn encode_rows(block: &RowBlock) -> Result<Vec<u8>> {
    let column_names = block.column_names();
    let rows = (0..block.row_count())
        .map(|i| {
            let values = column_names
                .iter()
                .map(|name| block.columns[name][i])
                .collect();
            (block.timestamps[i], values)
        })
        .collect();
    let data = RowFileData { column_names, rows };
    let raw = bincode::serialize(&data)
        .map_err(|e| RetrodictError::serialization(format!("row encode: {}", e)))?;
    zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| RetrodictError::serialization(format!("row compress: {}", e)))
}

/// Decode a row payload back into a block
pub(crate) fn decode_rows(bytes: &[u8]) -> Result<RowBlock> {
    let raw = zstd::decode_all(bytes)
        .map_err(|e| RetrodictError::corruption(format!("row decompress: {}", e)))?;
    let data: RowFileData = bincode::deserialize(&raw)
        .map_err(|e| RetrodictError::corruption(format!("row decode: {}", e)))?;

    let mut timestamps = Vec::with_capacity(data.rows.len());
    let mut columns: std::collections::BTreeMap<String, Vec<f64>> = data
        .column_names
        .iter()
        .map(|n| (n.clone(), Vec::with_capacity(data.rows.len())))
        .collect();
    for (ts, values) in data.rows {
        if values.len() != data.column_names.len() {
            return Err(RetrodictError::corruption("row width mismatch"));
        }
        timestamps.push(ts);
        for (name, value) in data.column_names.iter().zip(values) {
            columns.get_mut(name).expect("column exists").push(value);
        }
    }
    RowBlock::new(timestamps, columns)
}

/// Row-oriented backend rooted at a directory of datasets
pub struct RowBackend {
    root: PathBuf,
}

impl RowBackend {
    /// Create a backend rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        RowBackend { root: root.into() }
    }

    fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(dataset_id)
    }

    fn row_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_dir(dataset_id).join(ROW_FILE)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| {
            RetrodictError::transient_with_source(
                format!("cannot read row file {}", path.display()),
                e,
            )
        })
    }
}

impl StorageBackend for RowBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Row
    }

    fn contains(&self, dataset_id: &str) -> bool {
        self.row_path(dataset_id).exists()
    }

    fn manifest(&self, dataset_id: &str) -> Result<DatasetManifest> {
        DatasetManifest::load(&self.dataset_dir(dataset_id))
    }

    fn read_rows(&self, dataset_id: &str, range: Option<(usize, usize)>) -> Result<RowBlock> {
        let bytes = self.read_file(&self.row_path(dataset_id))?;
        let block = decode_rows(&bytes)?;
        Ok(match range {
            Some((start, end)) => block.slice_rows(start, end),
            None => block,
        })
    }

    fn write(
        &self,
        dataset_id: &str,
        block: &RowBlock,
        extra: &std::collections::BTreeMap<String, String>,
    ) -> Result<DatasetManifest> {
        let dir = self.dataset_dir(dataset_id);
        fs::create_dir_all(&dir)?;
        let bytes = encode_rows(block)?;

        let tmp = dir.join(format!("{}.tmp", ROW_FILE));
        let path = dir.join(ROW_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let manifest =
            DatasetManifest::new(BackendKind::Row, block.column_names(), block.row_count())
                .with_extra(extra.clone());
        manifest.store(&dir)?;
        debug!(
            target: "retrodict::storage",
            dataset = dataset_id,
            rows = block.row_count(),
            "row block written"
        );
        Ok(manifest)
    }
}
