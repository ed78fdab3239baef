//! Reading and removing the persisted blob of one sub-tree

use crate::config::PersistConfig;
use crate::transform::{run_transforms, Direction};
use rehydra_core::{InboundState, PersistResult};
use tracing::debug;

/// Load, decode and hydrate-transform the stored blob.
///
/// A missing or empty blob yields `None`. A key whose hydrate transforms
/// return `None` is left out of the result.
pub async fn get_stored_state(config: &PersistConfig) -> PersistResult<Option<InboundState>> {
    let storage = config.storage()?;
    let storage_key = config.storage_key();

    let blob = match storage.get_item(&storage_key).await? {
        Some(blob) if !blob.is_empty() => blob,
        _ => return Ok(None),
    };

    decode_blob(config, &blob).map(Some).map_err(|err| {
        if config.options.debug {
            debug!("Error restoring data {}: {}", blob, err);
        }
        err
    })
}

fn decode_blob(config: &PersistConfig, blob: &str) -> PersistResult<InboundState> {
    let envelope = config.deserializer.decode_envelope(blob)?;
    let mut state = InboundState::new();
    for (key, entry) in envelope {
        let value = config.deserializer.decode_entry(entry)?;
        if let Some(value) =
            run_transforms(&config.transforms, &key, Direction::BeforeRehydrate, value)?
        {
            state.insert(key, value);
        }
    }
    Ok(state)
}

/// Remove the stored blob
pub async fn purge_stored_state(config: &PersistConfig) -> PersistResult<()> {
    config.storage()?.remove_item(&config.storage_key()).await
}
