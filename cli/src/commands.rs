//! CLI commands against a sled-backed persistence store

use anyhow::{bail, Context};
use rehydra_core::{PersistOptions, PersistState, StateTree, Storage, PERSIST_KEY};
use rehydra_state::{
    create_persistoid, get_stored_state, purge_stored_state, PersistConfig, SharedSledStorage,
};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Client for the persisted blobs of one database
pub struct StoreClient {
    storage: SharedSledStorage,
    options: PersistOptions,
}

impl StoreClient {
    pub fn new(storage: SharedSledStorage, options: PersistOptions) -> Self {
        Self { storage, options }
    }

    fn config(&self, key: &str) -> PersistConfig {
        let options = PersistOptions {
            key: key.to_string(),
            ..self.options.clone()
        };
        PersistConfig::from_options(options).with_storage(Arc::clone(&self.storage))
    }

    /// Logical keys with a stored blob
    pub fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.storage.persisted_keys()?)
    }

    /// Stored state of `key`, decoded and hydrate-transformed
    pub async fn inspect(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let state = get_stored_state(&self.config(key)).await?;
        Ok(state.map(Value::Object))
    }

    /// The blob of `key` exactly as stored
    pub async fn raw(&self, key: &str) -> anyhow::Result<Option<String>> {
        let config = self.config(key);
        Ok(self.storage.get_item(&config.storage_key()).await?)
    }

    /// Persist a JSON object as the state of `key`; returns the number of keys written
    pub async fn seed(&self, key: &str, state: Value) -> anyhow::Result<usize> {
        let Some(tree) = StateTree::from_json(state) else {
            bail!("seed state must be a JSON object");
        };
        let tree = if tree.contains_key(PERSIST_KEY) {
            tree
        } else {
            tree.with_persist(PersistState::new(self.options.version).rehydrated())
        };

        let persistoid = create_persistoid(self.config(key))?;
        persistoid.update(&tree);
        persistoid.flush()?.await;

        info!("Seeded {} keys into {}", tree.len(), key);
        Ok(tree.len())
    }

    /// Remove the blob of `key`
    pub async fn purge(&self, key: &str) -> anyhow::Result<()> {
        purge_stored_state(&self.config(key)).await?;
        info!("Purged {}", key);
        Ok(())
    }
}

/// Read persist options from a JSON file
pub fn load_options(path: &Path) -> anyhow::Result<PersistOptions> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading options from {}", path.display()))?;
    let options = serde_json::from_str(&content)
        .with_context(|| format!("parsing options in {}", path.display()))?;
    Ok(options)
}

/// Read a JSON document from a file
pub fn load_json(path: &Path) -> anyhow::Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&content)?)
}
