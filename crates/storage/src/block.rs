//! Row blocks and filters
//!
//! A row block holds one contiguous time interval for one variable set:
//! monotonic non-decreasing timestamps plus per-variable numeric columns
//! aligned with them. All columns have equal length by construction.

use retrodict_core::{RetrodictError, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which backend served a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Memory-mapped columnar block files
    Columnar,
    /// Row-oriented fallback files
    Row,
    /// Remote object store
    ObjectStore,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Columnar => "columnar",
            BackendKind::Row => "row",
            BackendKind::ObjectStore => "object_store",
        };
        f.write_str(s)
    }
}

/// Metadata accompanying every block served by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Dataset the block came from
    pub dataset_id: String,
    /// Which backend actually served it
    pub source: BackendKind,
    /// First row index within the dataset
    pub start_row: usize,
    /// Rows in this block
    pub row_count: usize,
    /// Approximate resident bytes
    pub byte_size: usize,
}

/// Columnar rows for one contiguous time interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBlock {
    /// Monotonic non-decreasing timestamps
    pub timestamps: Vec<Timestamp>,
    /// Variable columns aligned with `timestamps`
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl RowBlock {
    /// Build a block, validating alignment and timestamp order
    pub fn new(timestamps: Vec<Timestamp>, columns: BTreeMap<String, Vec<f64>>) -> Result<Self> {
        for (name, column) in &columns {
            if column.len() != timestamps.len() {
                return Err(RetrodictError::invariant(format!(
                    "column {} has {} rows, timestamps have {}",
                    name,
                    column.len(),
                    timestamps.len()
                )));
            }
        }
        if timestamps.windows(2).any(|w| w[0] > w[1]) {
            return Err(RetrodictError::invariant(
                "timestamps must be non-decreasing",
            ));
        }
        Ok(RowBlock {
            timestamps,
            columns,
        })
    }

    /// Empty block with the given column names
    pub fn empty(column_names: &[String]) -> Self {
        RowBlock {
            timestamps: Vec::new(),
            columns: column_names
                .iter()
                .map(|n| (n.clone(), Vec::new()))
                .collect(),
        }
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.timestamps.len()
    }

    /// True when the block holds no rows
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Column names, key-ordered
    pub fn column_names(&self) -> Vec<String> {
        self.columns.keys().cloned().collect()
    }

    /// Approximate resident bytes, for cache accounting
    pub fn byte_size(&self) -> usize {
        let ts = self.timestamps.len() * std::mem::size_of::<Timestamp>();
        let cols: usize = self
            .columns
            .iter()
            .map(|(name, col)| name.len() + col.len() * std::mem::size_of::<f64>())
            .sum();
        ts + cols
    }

    /// One row as (timestamp, name -> value)
    pub fn row(&self, index: usize) -> Option<(Timestamp, BTreeMap<&str, f64>)> {
        let ts = *self.timestamps.get(index)?;
        let values = self
            .columns
            .iter()
            .map(|(name, col)| (name.as_str(), col[index]))
            .collect();
        Some((ts, values))
    }

    /// Copy out a contiguous row range
    pub fn slice_rows(&self, start: usize, end: usize) -> RowBlock {
        let end = end.min(self.row_count());
        let start = start.min(end);
        RowBlock {
            timestamps: self.timestamps[start..end].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|(name, col)| (name.clone(), col[start..end].to_vec()))
                .collect(),
        }
    }

    /// Keep only the named columns (projection)
    pub fn project(&self, names: &[String]) -> RowBlock {
        RowBlock {
            timestamps: self.timestamps.clone(),
            columns: self
                .columns
                .iter()
                .filter(|(name, _)| names.iter().any(|n| n == *name))
                .map(|(name, col)| (name.clone(), col.clone()))
                .collect(),
        }
    }

    /// Row range [start, end) whose timestamps fall inside [from, until)
    pub fn time_range_rows(&self, from: Timestamp, until: Timestamp) -> (usize, usize) {
        let start = self.timestamps.partition_point(|t| *t < from);
        let end = self.timestamps.partition_point(|t| *t < until);
        (start, end)
    }
}

/// Filter pushed down to backends where supported
///
/// Time bounds are half-open `[start, end)`. A `None` column set means all
/// columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFilter {
    /// Inclusive lower time bound
    pub start: Option<Timestamp>,
    /// Exclusive upper time bound
    pub end: Option<Timestamp>,
    /// Optional projection
    pub columns: Option<Vec<String>>,
}

impl RowFilter {
    /// Filter to a half-open time window
    pub fn time_window(start: Timestamp, end: Timestamp) -> Self {
        RowFilter {
            start: Some(start),
            end: Some(end),
            columns: None,
        }
    }

    /// Restrict the filter to named columns
    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    /// Apply in-process to a block (used when a backend lacks pushdown)
    pub fn apply(&self, block: &RowBlock) -> RowBlock {
        let from = self.start.unwrap_or(Timestamp::MIN);
        let until = self.end.unwrap_or(Timestamp::MAX);
        let (start, end) = block.time_range_rows(from, until);
        let sliced = block.slice_rows(start, end);
        match &self.columns {
            Some(names) => sliced.project(names),
            None => sliced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> RowBlock {
        let mut columns = BTreeMap::new();
        columns.insert("x".to_string(), vec![1.0, 2.0, 3.0, 4.0]);
        columns.insert("y".to_string(), vec![-1.0, -2.0, -3.0, -4.0]);
        RowBlock::new(vec![10, 20, 30, 40], columns).unwrap()
    }

    #[test]
    fn test_alignment_enforced() {
        let mut columns = BTreeMap::new();
        columns.insert("x".to_string(), vec![1.0]);
        let err = RowBlock::new(vec![10, 20], columns).unwrap_err();
        assert!(err.to_string().contains("rows"));
    }

    #[test]
    fn test_timestamps_must_be_ordered() {
        let mut columns = BTreeMap::new();
        columns.insert("x".to_string(), vec![1.0, 2.0]);
        assert!(RowBlock::new(vec![20, 10], columns).is_err());
    }

    #[test]
    fn test_row_access() {
        let block = sample_block();
        let (ts, values) = block.row(2).unwrap();
        assert_eq!(ts, 30);
        assert_eq!(values["x"], 3.0);
        assert_eq!(values["y"], -3.0);
        assert!(block.row(4).is_none());
    }

    #[test]
    fn test_slice_and_project() {
        let block = sample_block();
        let sliced = block.slice_rows(1, 3);
        assert_eq!(sliced.timestamps, vec![20, 30]);
        assert_eq!(sliced.columns["x"], vec![2.0, 3.0]);

        let projected = block.project(&["y".to_string()]);
        assert_eq!(projected.column_names(), vec!["y".to_string()]);
        assert_eq!(projected.row_count(), 4);
    }

    #[test]
    fn test_time_filter_half_open() {
        let block = sample_block();
        let filtered = RowFilter::time_window(20, 40).apply(&block);
        assert_eq!(filtered.timestamps, vec![20, 30]);
    }

    #[test]
    fn test_filter_with_projection() {
        let block = sample_block();
        let filtered = RowFilter::time_window(10, 50)
            .with_columns(vec!["x".to_string()])
            .apply(&block);
        assert_eq!(filtered.column_names(), vec!["x".to_string()]);
        assert_eq!(filtered.row_count(), 4);
    }

    #[test]
    fn test_byte_size_tracks_content() {
        let block = sample_block();
        assert!(block.byte_size() >= 4 * 8 + 2 * 4 * 8);
        assert!(block.slice_rows(0, 1).byte_size() < block.byte_size());
    }
}
