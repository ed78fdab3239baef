//! On-disk storage backed by sled

use async_trait::async_trait;
use rehydra_core::{PersistError, PersistResult, Storage, KEY_PREFIX};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

const BLOB_TREE: &str = "persist";

/// Persistent storage backed by a sled database
pub struct SledStorage {
    db: Db,
    blobs: Tree,
}

fn storage_err(err: sled::Error) -> PersistError {
    PersistError::Storage(err.to_string())
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> PersistResult<Self> {
        let db = sled::open(path).map_err(storage_err)?;
        let blobs = db.open_tree(BLOB_TREE).map_err(storage_err)?;
        Ok(Self { db, blobs })
    }

    /// Logical keys of every stored blob, prefix stripped
    pub fn persisted_keys(&self) -> PersistResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in self.blobs.scan_prefix(KEY_PREFIX.as_bytes()) {
            let (key, _) = entry.map_err(storage_err)?;
            let key = String::from_utf8_lossy(&key);
            keys.push(key[KEY_PREFIX.len()..].to_string());
        }
        Ok(keys)
    }

    /// Get database size estimate
    pub fn size_estimate(&self) -> u64 {
        self.blobs.len() as u64
    }
}

#[async_trait]
impl Storage for SledStorage {
    async fn get_item(&self, key: &str) -> PersistResult<Option<String>> {
        match self.blobs.get(key).map_err(storage_err)? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| PersistError::Storage(format!("stored value is not utf-8: {e}"))),
            None => Ok(None),
        }
    }

    async fn set_item(&self, key: &str, value: String) -> PersistResult<()> {
        self.blobs
            .insert(key.as_bytes(), value.into_bytes())
            .map_err(storage_err)?;
        self.db.flush_async().await.map_err(storage_err)?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> PersistResult<()> {
        self.blobs.remove(key.as_bytes()).map_err(storage_err)?;
        self.db.flush_async().await.map_err(storage_err)?;
        Ok(())
    }
}

/// Thread-safe sled storage wrapper
pub type SharedSledStorage = Arc<SledStorage>;

/// Open a shared sled storage
pub fn create_sled_storage<P: AsRef<Path>>(path: P) -> PersistResult<SharedSledStorage> {
    Ok(Arc::new(SledStorage::open(path)?))
}
