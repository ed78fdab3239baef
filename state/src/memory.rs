//! In-memory storage for tests and ephemeral sessions

use async_trait::async_trait;
use dashmap::DashMap;
use rehydra_core::{PersistResult, Storage};
use std::sync::Arc;

/// In-memory key/value storage
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data<I, K, V>(data: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let storage = Self::new();
        for (key, value) in data {
            storage.data.insert(key.into(), value.into());
        }
        storage
    }

    /// Synchronous read, bypassing the async seam
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl Clone for MemoryStorage {
    fn clone(&self) -> Self {
        let storage = Self::new();
        for entry in self.data.iter() {
            storage.data.insert(entry.key().clone(), entry.value().clone());
        }
        storage
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_item(&self, key: &str) -> PersistResult<Option<String>> {
        Ok(self.get(key))
    }

    async fn set_item(&self, key: &str, value: String) -> PersistResult<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> PersistResult<()> {
        self.data.remove(key);
        Ok(())
    }
}

/// Thread-safe memory storage wrapper
pub type SharedMemoryStorage = Arc<MemoryStorage>;

/// Create a shared memory storage
pub fn create_memory_storage() -> SharedMemoryStorage {
    Arc::new(MemoryStorage::new())
}
