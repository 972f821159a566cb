//! Object-store backend
//!
//! Last link in the fallback chain. The client abstraction is transport
//! neutral: a filesystem implementation ships for local use and tests,
//! while cloud clients plug in behind the same trait. Payloads reuse the
//! row-file encoding; manifests are stored as JSON objects next to them.

use crate::backend::StorageBackend;
use crate::block::{BackendKind, RowBlock};
use crate::manifest::DatasetManifest;
use crate::rowfile::{decode_rows, encode_rows};
use retrodict_core::{RetrodictError, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Minimal object-store client surface
pub trait ObjectStoreClient: Send + Sync {
    /// Fetch an object; `Ok(None)` when the key does not exist
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store an object, replacing any existing one
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;
}

/// Filesystem-backed object store
///
/// Keys map to paths under a root directory; puts are temp-and-rename so
/// concurrent readers never see partial objects.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsObjectStore { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ObjectStoreClient for FsObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RetrodictError::transient_with_source(
                format!("object get {}", key),
                e,
            )),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Object-store backend adapting a client to the backend trait
pub struct ObjectBackend {
    client: Box<dyn ObjectStoreClient>,
}

impl ObjectBackend {
    /// Wrap a client
    pub fn new(client: Box<dyn ObjectStoreClient>) -> Self {
        ObjectBackend { client }
    }

    fn data_key(dataset_id: &str) -> String {
        format!("datasets/{}/rows.bin.zst", dataset_id)
    }

    fn manifest_key(dataset_id: &str) -> String {
        format!("datasets/{}/manifest.json", dataset_id)
    }
}

impl StorageBackend for ObjectBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn contains(&self, dataset_id: &str) -> bool {
        matches!(self.client.get(&Self::data_key(dataset_id)), Ok(Some(_)))
    }

    fn manifest(&self, dataset_id: &str) -> Result<DatasetManifest> {
        let bytes = self
            .client
            .get(&Self::manifest_key(dataset_id))?
            .ok_or_else(|| RetrodictError::not_found(dataset_id))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RetrodictError::corruption(format!("object manifest: {}", e)))
    }

    fn read_rows(&self, dataset_id: &str, range: Option<(usize, usize)>) -> Result<RowBlock> {
        let bytes = self
            .client
            .get(&Self::data_key(dataset_id))?
            .ok_or_else(|| RetrodictError::not_found(dataset_id))?;
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
        let manifest = DatasetManifest::new(
            BackendKind::ObjectStore,
            block.column_names(),
            block.row_count(),
        )
        .with_extra(extra.clone());
        self.client
            .put(&Self::data_key(dataset_id), &encode_rows(block)?)?;
        self.client.put(
            &Self::manifest_key(dataset_id),
            &serde_json::to_vec_pretty(&manifest)?,
        )?;
        debug!(
            target: "retrodict::storage",
            dataset = dataset_id,
            rows = block.row_count(),
            "object block uploaded"
        );
        Ok(manifest)
    }
}
