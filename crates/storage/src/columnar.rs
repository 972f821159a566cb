//! Memory-mapped columnar backend
//!
//! One block file per dataset, holding fixed-stride little-endian columns
//! so any row range can be sliced straight out of the mapping without
//! decoding the rest of the file.
//!
//! ## File Format (Version 1)
//!
//! ```text
//! [magic "RCOL" 4B]
//! [version u32 LE]
//! [column_count u32 LE]
//! [row_count u64 LE]
//! [column directory: column_count * (name_len u16 LE, name bytes)]
//! [timestamps: row_count * i64 LE]
//! [columns: column_count * row_count * f64 LE]
//! [crc32 u32 LE of all preceding bytes after the magic]
//! ```
//!
//! Columns are laid out in directory order, which is the canonical
//! (sorted) column order. Publication is temp-file-and-rename.

use crate::backend::StorageBackend;
use crate::block::{BackendKind, RowBlock};
use crate::manifest::DatasetManifest;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::Mmap;
use retrodict_core::{RetrodictError, Result, Timestamp};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes identifying a columnar block file
const MAGIC: &[u8; 4] = b"RCOL";
/// Current format version
const VERSION: u32 = 1;
/// Header size: magic(4) + version(4) + column_count(4) + row_count(8)
const HEADER_SIZE: usize = 4 + 4 + 4 + 8;

const BLOCK_FILE: &str = "block.rcol";

/// Parsed header and layout of a mapped block file
struct MappedBlock {
    mmap: Mmap,
    column_names: Vec<String>,
    row_count: usize,
    timestamps_offset: usize,
    columns_offset: usize,
}

impl MappedBlock {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            RetrodictError::transient_with_source(
                format!("cannot open block file {}", path.display()),
                e,
            )
        })?;
        // SAFETY: the mapping is read-only and the file was opened read-only.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
            RetrodictError::transient_with_source(
                format!("cannot map block file {}", path.display()),
                e,
            )
        })?;

        if mmap.len() < HEADER_SIZE + 4 {
            return Err(RetrodictError::corruption("block file too small for header"));
        }
        let data = &mmap[..];
        if &data[0..4] != MAGIC {
            return Err(RetrodictError::corruption("invalid block file magic"));
        }
        let version = LittleEndian::read_u32(&data[4..8]);
        if version != VERSION {
            return Err(RetrodictError::corruption(format!(
                "unsupported block file version {}",
                version
            )));
        }
        let column_count = LittleEndian::read_u32(&data[8..12]) as usize;
        let row_count = LittleEndian::read_u64(&data[12..20]) as usize;

        // Verify the checksum before trusting the directory.
        let crc_offset = mmap.len() - 4;
        let stored = LittleEndian::read_u32(&data[crc_offset..]);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[4..crc_offset]);
        if hasher.finalize() != stored {
            return Err(RetrodictError::corruption("block file checksum mismatch"));
        }

        let mut offset = HEADER_SIZE;
        let mut column_names = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            if offset + 2 > crc_offset {
                return Err(RetrodictError::corruption("truncated column directory"));
            }
            let len = LittleEndian::read_u16(&data[offset..offset + 2]) as usize;
            offset += 2;
            if offset + len > crc_offset {
                return Err(RetrodictError::corruption("truncated column name"));
            }
            let name = std::str::from_utf8(&data[offset..offset + len])
                .map_err(|_| RetrodictError::corruption("column name is not UTF-8"))?
                .to_string();
            offset += len;
            column_names.push(name);
        }

        let timestamps_offset = offset;
        let columns_offset = timestamps_offset + row_count * 8;
        let expected_end = columns_offset + column_count * row_count * 8;
        if expected_end != crc_offset {
            return Err(RetrodictError::corruption(format!(
                "block file length mismatch: expected {} data bytes, found {}",
                expected_end, crc_offset
            )));
        }

        Ok(MappedBlock {
            mmap,
            column_names,
            row_count,
            timestamps_offset,
            columns_offset,
        })
    }

    fn timestamp(&self, row: usize) -> Timestamp {
        let at = self.timestamps_offset + row * 8;
        LittleEndian::read_i64(&self.mmap[at..at + 8])
    }

    fn read_rows(&self, start: usize, end: usize) -> Result<RowBlock> {
        let end = end.min(self.row_count);
        let start = start.min(end);
        let n = end - start;

        let ts_at = self.timestamps_offset + start * 8;
        let mut timestamps = vec![0i64; n];
        LittleEndian::read_i64_into(&self.mmap[ts_at..ts_at + n * 8], &mut timestamps);

        let mut columns = BTreeMap::new();
        for (i, name) in self.column_names.iter().enumerate() {
            let col_at = self.columns_offset + (i * self.row_count + start) * 8;
            let mut values = vec![0f64; n];
            LittleEndian::read_f64_into(&self.mmap[col_at..col_at + n * 8], &mut values);
            columns.insert(name.clone(), values);
        }
        RowBlock::new(timestamps, columns)
    }

    /// Binary-search the mapped timestamps for a half-open time window
    fn row_range_for_time(&self, start: Timestamp, end: Timestamp) -> (usize, usize) {
        let lower = self.partition_point(|t| t < start);
        let upper = self.partition_point(|t| t < end);
        (lower, upper)
    }

    fn partition_point(&self, pred: impl Fn(Timestamp) -> bool) -> usize {
        let mut lo = 0usize;
        let mut hi = self.row_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.timestamp(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// Columnar backend rooted at a directory of datasets
pub struct ColumnarBackend {
    root: PathBuf,
}

impl ColumnarBackend {
    /// Create a backend rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ColumnarBackend { root: root.into() }
    }

    fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(dataset_id)
    }

    fn block_path(&self, dataset_id: &str) -> PathBuf {
        self.dataset_dir(dataset_id).join(BLOCK_FILE)
    }

    fn encode(block: &RowBlock) -> Vec<u8> {
        let row_count = block.row_count();
        let names = block.column_names();
        let mut out = Vec::with_capacity(HEADER_SIZE + row_count * 8 * (names.len() + 1));
        out.extend_from_slice(MAGIC);
        out.write_u32::<LittleEndian>(VERSION).unwrap();
        out.write_u32::<LittleEndian>(names.len() as u32).unwrap();
        out.write_u64::<LittleEndian>(row_count as u64).unwrap();
        for name in &names {
            out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
            out.extend_from_slice(name.as_bytes());
        }
        for ts in &block.timestamps {
            out.write_i64::<LittleEndian>(*ts).unwrap();
        }
        for name in &names {
            for value in &block.columns[name] {
                out.write_f64::<LittleEndian>(*value).unwrap();
            }
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&out[4..]);
        let crc = hasher.finalize();
        out.write_u32::<LittleEndian>(crc).unwrap();
        out
    }
}

impl StorageBackend for ColumnarBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Columnar
    }

    fn contains(&self, dataset_id: &str) -> bool {
        self.block_path(dataset_id).exists()
    }

    fn manifest(&self, dataset_id: &str) -> Result<DatasetManifest> {
        DatasetManifest::load(&self.dataset_dir(dataset_id))
    }

    fn read_rows(&self, dataset_id: &str, range: Option<(usize, usize)>) -> Result<RowBlock> {
        let mapped = MappedBlock::open(&self.block_path(dataset_id))?;
        let (start, end) = range.unwrap_or((0, mapped.row_count));
        mapped.read_rows(start, end)
    }

    fn supports_time_pushdown(&self) -> bool {
        true
    }

    fn row_range_for_time(
        &self,
        dataset_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<(usize, usize)> {
        let mapped = MappedBlock::open(&self.block_path(dataset_id))?;
        Ok(mapped.row_range_for_time(start, end))
    }

    fn write(
        &self,
        dataset_id: &str,
        block: &RowBlock,
        extra: &std::collections::BTreeMap<String, String>,
    ) -> Result<DatasetManifest> {
        let dir = self.dataset_dir(dataset_id);
        fs::create_dir_all(&dir)?;
        let bytes = Self::encode(block);

        let tmp = dir.join(format!("{}.tmp", BLOCK_FILE));
        let path = dir.join(BLOCK_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let manifest = DatasetManifest::new(
            BackendKind::Columnar,
            block.column_names(),
            block.row_count(),
        )
        .with_extra(extra.clone());
        manifest.store(&dir)?;
        debug!(
            target: "retrodict::storage",
            dataset = dataset_id,
            rows = block.row_count(),
            bytes = bytes.len(),
            "columnar block written"
        );
        Ok(manifest)
    }
}
