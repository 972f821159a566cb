//! Dataset manifests
//!
//! Each dataset is addressed by `dataset_id` and carries a manifest
//! describing its format, schema, and row count. Manifests are published
//! atomically via temp-file-and-rename so readers never observe a partial
//! write.

use crate::block::BackendKind;
use retrodict_core::{Result, RetrodictError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// On-disk manifest for one dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    /// Storage format of the block files
    pub format: BackendKind,
    /// Schema version of the block layout
    pub schema_version: u32,
    /// Column names, in canonical order
    pub column_names: Vec<String>,
    /// Total rows across all block files
    pub row_count: usize,
    /// Creation time, RFC 3339
    pub created_at: String,
    /// Caller-supplied metadata stored alongside the dataset
    #[serde(default)]
    pub extra: std::collections::BTreeMap<String, String>,
}

impl DatasetManifest {
    /// Build a manifest for freshly written data
    pub fn new(format: BackendKind, column_names: Vec<String>, row_count: usize) -> Self {
        DatasetManifest {
            format,
            schema_version: 1,
            column_names,
            row_count,
            created_at: chrono::Utc::now().to_rfc3339(),
            extra: std::collections::BTreeMap::new(),
        }
    }

    /// Attach caller-supplied metadata
    pub fn with_extra(mut self, extra: std::collections::BTreeMap<String, String>) -> Self {
        self.extra = extra;
        self
    }

    /// Load a manifest from `dir/manifest.json`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("manifest.json");
        let raw = fs::read(&path).map_err(|e| {
            RetrodictError::transient_with_source(
                format!("cannot read manifest {}", path.display()),
                e,
            )
        })?;
        serde_json::from_slice(&raw).map_err(|e| {
            RetrodictError::corruption(format!("manifest {}: {}", path.display(), e))
        })
    }

    /// Atomically publish the manifest into `dir`
    pub fn store(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join("manifest.json.tmp");
        let path = dir.join("manifest.json");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manifest = DatasetManifest::new(
            BackendKind::Columnar,
            vec!["x".to_string(), "y".to_string()],
            128,
        );
        manifest.store(dir.path()).unwrap();
        let loaded = DatasetManifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_missing_manifest_is_transient() {
        let dir = TempDir::new().unwrap();
        let err = DatasetManifest::load(dir.path()).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_corrupt_manifest_detected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("manifest.json"), b"{ not json").unwrap();
        let err = DatasetManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, RetrodictError::Corruption { .. }));
    }

    #[test]
    fn test_store_replaces_atomically() {
        let dir = TempDir::new().unwrap();
        let first = DatasetManifest::new(BackendKind::Row, vec!["x".to_string()], 1);
        first.store(dir.path()).unwrap();
        let second = DatasetManifest::new(BackendKind::Columnar, vec!["x".to_string()], 2);
        second.store(dir.path()).unwrap();
        assert_eq!(DatasetManifest::load(dir.path()).unwrap(), second);
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }
}
