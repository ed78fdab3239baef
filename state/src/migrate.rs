//! Versioned migrations of previously persisted state

use async_trait::async_trait;
use rehydra_core::{
    InboundState, PersistError, PersistResult, PersistState, DEFAULT_VERSION, PERSIST_KEY,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Brings loaded state up to the configured version
#[async_trait]
pub trait Migrate: Send + Sync {
    async fn migrate(
        &self,
        state: Option<InboundState>,
        current_version: i64,
    ) -> PersistResult<Option<InboundState>>;
}

#[async_trait]
impl<F> Migrate for F
where
    F: Fn(Option<InboundState>, i64) -> PersistResult<Option<InboundState>> + Send + Sync,
{
    async fn migrate(
        &self,
        state: Option<InboundState>,
        current_version: i64,
    ) -> PersistResult<Option<InboundState>> {
        self(state, current_version)
    }
}

/// Pass-through used when no migration is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMigration;

#[async_trait]
impl Migrate for NoMigration {
    async fn migrate(
        &self,
        state: Option<InboundState>,
        _current_version: i64,
    ) -> PersistResult<Option<InboundState>> {
        Ok(state)
    }
}

/// One migration step: state at the previous version to state at this one
pub type MigrationFn = Arc<dyn Fn(InboundState) -> PersistResult<InboundState> + Send + Sync>;

/// Migration steps indexed by the version they produce
#[derive(Clone, Default)]
pub struct MigrationManifest {
    steps: BTreeMap<i64, MigrationFn>,
}

impl MigrationManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step producing `version`
    pub fn step<F>(mut self, version: i64, f: F) -> Self
    where
        F: Fn(InboundState) -> PersistResult<InboundState> + Send + Sync + 'static,
    {
        self.steps.insert(version, Arc::new(f));
        self
    }

    pub fn versions(&self) -> Vec<i64> {
        self.steps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for MigrationManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationManifest")
            .field("versions", &self.versions())
            .finish()
    }
}

/// [`Migrate`] driven by a [`MigrationManifest`]
#[derive(Debug, Clone)]
pub struct ManifestMigrate {
    manifest: MigrationManifest,
}

/// Build a migration from a manifest
pub fn create_migrate(manifest: MigrationManifest) -> ManifestMigrate {
    ManifestMigrate { manifest }
}

/// Version recorded in a loaded blob's `_persist` slot
pub fn stored_version(state: &InboundState) -> i64 {
    state
        .get(PERSIST_KEY)
        .and_then(PersistState::from_json)
        .map(|meta| meta.version)
        .unwrap_or(DEFAULT_VERSION)
}

#[async_trait]
impl Migrate for ManifestMigrate {
    async fn migrate(
        &self,
        state: Option<InboundState>,
        current_version: i64,
    ) -> PersistResult<Option<InboundState>> {
        let Some(mut state) = state else {
            debug!("No inbound state, skipping migration");
            return Ok(None);
        };

        let inbound_version = stored_version(&state);
        if inbound_version == current_version {
            debug!("Versions match ({}), noop migration", current_version);
            return Ok(Some(state));
        }
        if inbound_version > current_version {
            error!(
                "Downgrading version is not supported: stored {} > target {}",
                inbound_version, current_version
            );
            return Ok(Some(state));
        }

        for (&version, step) in self.manifest.steps.range(inbound_version + 1..=current_version) {
            info!("Running migration for version {}", version);
            state = step(state).map_err(|err| match err {
                err @ PersistError::Migration { .. } => err,
                other => PersistError::Migration {
                    version,
                    reason: other.to_string(),
                },
            })?;
        }

        Ok(Some(state))
    }
}
