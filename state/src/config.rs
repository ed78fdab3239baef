//! Runtime configuration of one persisted sub-tree

use crate::codec::{Deserializer, Serializer};
use crate::migrate::Migrate;
use crate::transform::Transform;
use rehydra_core::{
    KeyFilter, MergeDepth, PersistError, PersistOptions, PersistResult, Storage, KEY_PREFIX,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback receiving an error the engine could not return to a caller
pub type ErrorHook = Arc<dyn Fn(&PersistError) + Send + Sync>;

/// Everything one persisted reducer needs: options plus live collaborators
#[derive(Clone, Default)]
pub struct PersistConfig {
    pub options: PersistOptions,
    pub storage: Option<Arc<dyn Storage>>,
    pub transforms: Vec<Transform>,
    pub migrate: Option<Arc<dyn Migrate>>,
    pub serializer: Serializer,
    pub deserializer: Deserializer,
    /// Called when a storage write fails
    pub write_fail_handler: Option<ErrorHook>,
    /// Called when activation fails (load error, migration error, timeout)
    pub on_error: Option<ErrorHook>,
}

impl PersistConfig {
    pub fn new<S>(key: impl Into<String>, storage: S) -> Self
    where
        S: Storage + 'static,
    {
        Self::from_options(PersistOptions::new(key)).with_storage(storage)
    }

    pub fn from_options(options: PersistOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn key(&self) -> &str {
        &self.options.key
    }

    /// Key under which the blob is stored
    pub fn storage_key(&self) -> String {
        format!("{}{}", KEY_PREFIX, self.options.key)
    }

    pub fn key_filter(&self) -> KeyFilter {
        self.options.key_filter()
    }

    /// Fails fast when the key or the storage is missing
    pub fn validate(&self) -> PersistResult<()> {
        if self.options.key.is_empty() {
            return Err(PersistError::MissingKey);
        }
        self.storage().map(|_| ())
    }

    pub fn storage(&self) -> PersistResult<&Arc<dyn Storage>> {
        self.storage.as_ref().ok_or(PersistError::MissingStorage)
    }

    pub fn with_storage<S>(mut self, storage: S) -> Self
    where
        S: Storage + 'static,
    {
        self.storage = Some(Arc::new(storage));
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.options.version = version;
        self
    }

    pub fn with_allowlist<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.options.allowlist = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_blocklist<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.options.blocklist = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.options.throttle_ms = u64::try_from(throttle.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// `Duration::ZERO` disables the activation timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_rehydration_depth(mut self, depth: MergeDepth) -> Self {
        self.options.rehydration_depth = depth;
        self
    }

    pub fn with_migrate<M>(mut self, migrate: M) -> Self
    where
        M: Migrate + 'static,
    {
        self.migrate = Some(Arc::new(migrate));
        self
    }

    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_deserializer(mut self, deserializer: Deserializer) -> Self {
        self.deserializer = deserializer;
        self
    }

    pub fn on_write_fail<F>(mut self, f: F) -> Self
    where
        F: Fn(&PersistError) + Send + Sync + 'static,
    {
        self.write_fail_handler = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&PersistError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for PersistConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistConfig")
            .field("options", &self.options)
            .field("storage", &self.storage.is_some())
            .field("transforms", &self.transforms)
            .field("migrate", &self.migrate.is_some())
            .field("serializer", &self.serializer)
            .field("deserializer", &self.deserializer)
            .finish()
    }
}
