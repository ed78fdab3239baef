//! Incremental write engine for one persisted sub-tree
//!
//! `update` diffs the new tree against the last one it saw and queues the
//! top-level keys whose substate changed identity or disappeared. A ticker
//! drains one key per period through the persist-direction transforms and the
//! serializer into a staged set. When the queue empties, the whole staged set
//! is written as one blob.

use crate::config::PersistConfig;
use crate::transform::{run_transforms, Direction};
use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use rehydra_core::{KeyFilter, PersistError, PersistResult, SameRef, StateTree, Storage};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error};

/// Shortest ticker period; a zero throttle still defers to the next tick
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Handle to the most recently started storage write
pub type PendingWrite = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct PersistoidState {
    last_state: StateTree,
    staged: Map<String, Value>,
    queue: VecDeque<String>,
    ticking: bool,
    write: Option<PendingWrite>,
    tick_error: Option<PersistError>,
}

struct PersistoidInner {
    config: Arc<PersistConfig>,
    storage: Arc<dyn Storage>,
    storage_key: String,
    filter: KeyFilter,
    state: Mutex<PersistoidState>,
}

/// Write engine bound to one storage key
///
/// Cloning yields another handle to the same engine. `update` spawns the
/// ticker, so it must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct Persistoid {
    inner: Arc<PersistoidInner>,
}

/// Validate `config` and build a persistoid for it
pub fn create_persistoid(config: impl Into<Arc<PersistConfig>>) -> PersistResult<Persistoid> {
    let config = config.into();
    config.validate()?;
    let storage = Arc::clone(config.storage()?);
    Ok(Persistoid::new(config, storage))
}

impl Persistoid {
    pub fn new(config: Arc<PersistConfig>, storage: Arc<dyn Storage>) -> Self {
        Self {
            inner: Arc::new(PersistoidInner {
                storage_key: config.storage_key(),
                filter: config.key_filter(),
                config,
                storage,
                state: Mutex::new(PersistoidState::default()),
            }),
        }
    }

    /// Queue every changed or removed key of `next` and make sure the ticker runs
    pub fn update(&self, next: &StateTree) {
        let filter = &self.inner.filter;
        let mut state = self.inner.state.lock();
        let state = &mut *state;

        for (key, value) in next.iter() {
            if !filter.passes(key) {
                continue;
            }
            if state.last_state.get(key).same_ref(&Some(value)) {
                continue;
            }
            if !state.queue.iter().any(|queued| queued == key) {
                state.queue.push_back(key.to_string());
            }
        }

        for key in state.last_state.keys() {
            if !next.contains_key(key)
                && filter.passes(key)
                && !state.queue.iter().any(|queued| queued == key)
            {
                state.queue.push_back(key.to_string());
            }
        }

        if !state.ticking {
            state.ticking = true;
            self.start_ticker();
        }

        state.last_state = next.clone();
    }

    /// Drain the queue now and return the write it produced.
    ///
    /// Every queued key is processed and the staged set written even when a
    /// key fails. The first error, starting with one raised by an earlier timer
    /// tick, is then returned instead of the write; `pending_write` still
    /// yields it.
    pub fn flush(&self) -> PersistResult<PendingWrite> {
        let mut state = self.inner.state.lock();
        let mut failure = state.tick_error.take();
        while !state.queue.is_empty() {
            if let Err(err) = self.process_next_key(&mut state) {
                error!(
                    "Error persisting state for key {}: {}",
                    self.inner.config.key(),
                    err
                );
                failure.get_or_insert(err);
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(Self::current_write(&state)),
        }
    }

    /// The most recently started write, or a ready future when none was started
    pub fn pending_write(&self) -> PendingWrite {
        Self::current_write(&self.inner.state.lock())
    }

    fn current_write(state: &PersistoidState) -> PendingWrite {
        state
            .write
            .clone()
            .unwrap_or_else(|| future::ready(()).boxed().shared())
    }

    /// Keys waiting to be staged
    pub fn pending_keys(&self) -> Vec<String> {
        self.inner.state.lock().queue.iter().cloned().collect()
    }

    fn start_ticker(&self) {
        let persistoid = self.clone();
        let period = self.inner.config.options.throttle().max(MIN_TICK);
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if !persistoid.tick() {
                    break;
                }
            }
        });
    }

    /// One ticker step; `false` once the queue is empty and the ticker stops
    fn tick(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.queue.is_empty() {
            state.ticking = false;
            return false;
        }
        if let Err(err) = self.process_next_key(&mut state) {
            error!(
                "Error persisting state for key {}: {}",
                self.inner.config.key(),
                err
            );
            state.tick_error = Some(err);
        }
        true
    }

    fn process_next_key(&self, state: &mut PersistoidState) -> PersistResult<()> {
        let Some(key) = state.queue.pop_front() else {
            return Ok(());
        };

        let staged = self.stage_key(state, key);
        if state.queue.is_empty() {
            self.write_staged_state(state);
        }
        staged
    }

    /// Run one key through the transforms and serializer into the staged set
    fn stage_key(&self, state: &mut PersistoidState, key: String) -> PersistResult<()> {
        let current = state.last_state.get(&key).map(|substate| substate.to_json());
        let transformed = match current {
            Some(value) => run_transforms(
                &self.inner.config.transforms,
                &key,
                Direction::BeforePersist,
                value,
            )?,
            None => None,
        };

        match transformed {
            Some(value) => {
                let entry = self.inner.config.serializer.encode_entry(&value)?;
                state.staged.insert(key, entry);
            }
            None => {
                state.staged.remove(&key);
            }
        }
        Ok(())
    }

    fn write_staged_state(&self, state: &mut PersistoidState) {
        let last_state = &state.last_state;
        state.staged.retain(|key, _| last_state.contains_key(key));

        let blob = self.inner.config.serializer.encode_envelope(&state.staged);
        let storage = Arc::clone(&self.inner.storage);
        let storage_key = self.inner.storage_key.clone();
        let on_write_fail = self.inner.config.write_fail_handler.clone();
        let previous = state.write.take();

        debug!("Writing {} staged keys to {}", state.staged.len(), storage_key);

        let task = tokio::spawn(async move {
            // keep writes to one key in dispatch order
            if let Some(previous) = previous {
                previous.await;
            }
            let result = match blob {
                Ok(blob) => storage.set_item(&storage_key, blob).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                error!("Error storing data: {}", err);
                if let Some(handler) = on_write_fail {
                    handler(&err);
                }
            }
        });

        let write = async move {
            if let Err(err) = task.await {
                error!("Write task failed: {}", err);
            }
        };
        state.write = Some(write.boxed().shared());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Serializer;
    use crate::testing::{init_tracing, tree, BrokenStorage, RecordingStorage};
    use crate::transform::Transform;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn persistoid(config: PersistConfig) -> Persistoid {
        create_persistoid(config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_transformed_data_to_storage() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("persist-test", Arc::clone(&storage)).with_transform(
            Transform::builder("count")
                .before_persist(|v| Ok(v.as_i64().map(|n| json!(n * 10))))
                .build()
                .unwrap(),
        );
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "count": 5 })));
        sleep(Duration::from_millis(5)).await;

        assert_eq!(
            storage.writes(),
            vec![("persist:persist-test".to_string(), r#"{"count":"50"}"#.to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transform_skips_key_but_writes_others() {
        init_tracing();
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("persist-test", Arc::clone(&storage))
            .with_transform(
                Transform::builder("count")
                    .before_persist(|_| Err(anyhow::anyhow!("transform error").into()))
                    .build()
                    .unwrap(),
            )
            .with_transform(
                Transform::builder("name")
                    .before_persist(|v| Ok(v.as_str().map(|s| json!(s.to_uppercase()))))
                    .build()
                    .unwrap(),
            );
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "count": 5, "name": "alice" })));
        sleep(Duration::from_millis(5)).await;

        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.last_write().unwrap(), r#"{"name":"\"ALICE\""}"#);

        let err = persistoid.flush().unwrap_err();
        assert!(err.to_string().contains("transform error"));
        // reported once
        assert!(persistoid.flush().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialization_error_prevents_write() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("persist-test", Arc::clone(&storage)).with_serializer(
            Serializer::custom(|_| Err(PersistError::Serialization("serialization error".into()))),
        );
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1 })));
        sleep(Duration::from_millis(5)).await;

        assert_eq!(storage.write_count(), 0);
        assert!(matches!(
            persistoid.flush(),
            Err(PersistError::Serialization(msg)) if msg == "serialization error"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_throttle_is_not_synchronous() {
        let storage = RecordingStorage::new();
        let persistoid = persistoid(PersistConfig::new("k", Arc::clone(&storage)));

        persistoid.update(&tree(json!({ "a": 1 })));
        tokio::task::yield_now().await;
        assert_eq!(storage.write_count(), 0);
        assert_eq!(persistoid.pending_keys(), vec!["a".to_string()]);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_substates_are_not_rewritten() {
        let storage = RecordingStorage::new();
        let persistoid = persistoid(PersistConfig::new("k", Arc::clone(&storage)));

        let state = tree(json!({ "a": 1, "b": 2 }));
        persistoid.update(&state);
        sleep(Duration::from_millis(5)).await;
        assert_eq!(storage.write_count(), 1);

        persistoid.update(&state);
        persistoid.update(&state.clone());
        sleep(Duration::from_millis(5)).await;
        assert_eq!(storage.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_keys_leave_the_blob() {
        let storage = RecordingStorage::new();
        let persistoid = persistoid(PersistConfig::new("k", Arc::clone(&storage)));

        persistoid.update(&tree(json!({ "a": 1 })));
        sleep(Duration::from_millis(5)).await;
        persistoid.update(&tree(json!({})));
        sleep(Duration::from_millis(5)).await;

        assert_eq!(storage.last_write().unwrap(), "{}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_removed_while_queued_is_not_written() {
        let storage = RecordingStorage::new();
        let persistoid = persistoid(PersistConfig::new("k", Arc::clone(&storage)));

        persistoid.update(&tree(json!({ "a": 1, "b": 2 })));
        persistoid.update(&tree(json!({ "b": 3 })));
        persistoid.flush().unwrap().await;

        assert_eq!(storage.last_write().unwrap(), r#"{"b":"3"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_before_throttle_elapses() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("k", Arc::clone(&storage))
            .with_throttle(Duration::from_millis(500));
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1, "b": "two" })));
        persistoid.flush().unwrap().await;

        assert_eq!(
            storage.inner.get("persist:k").unwrap(),
            r#"{"a":"1","b":"\"two\""}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_without_pending_work_resolves() {
        let storage = RecordingStorage::new();
        let persistoid = persistoid(PersistConfig::new("k", Arc::clone(&storage)));
        persistoid.flush().unwrap().await;
        assert_eq!(storage.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spaces_out_keys() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("k", Arc::clone(&storage))
            .with_throttle(Duration::from_millis(100));
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1, "b": 2, "c": 3 })));
        sleep(Duration::from_millis(250)).await;
        assert_eq!(storage.write_count(), 0);
        assert_eq!(persistoid.pending_keys(), vec!["c".to_string()]);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.last_write().unwrap(), r#"{"a":"1","b":"2","c":"3"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowlist_limits_persisted_keys() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("k", Arc::clone(&storage)).with_allowlist(["a"]);
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1, "b": 2, "_persist": { "version": 1, "rehydrated": true } })));
        persistoid.flush().unwrap().await;

        let blob: Value = serde_json::from_str(&storage.last_write().unwrap()).unwrap();
        let keys: Vec<&String> = blob.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["_persist", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocklist_excludes_keys() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("k", Arc::clone(&storage))
            .with_allowlist(["a", "b"])
            .with_blocklist(["b"]);
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1, "b": 2, "c": 3 })));
        persistoid.flush().unwrap().await;

        assert_eq!(storage.last_write().unwrap(), r#"{"a":"1"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_calls_handler() {
        let storage = Arc::new(BrokenStorage::default());
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&failures);
        let config = PersistConfig::new("k", Arc::clone(&storage)).on_write_fail(move |err| {
            assert!(matches!(err, PersistError::Storage(_)));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1 })));
        persistoid.flush().unwrap().await;

        assert_eq!(storage.write_attempts(), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_during_write_accumulate_for_next_batch() {
        let storage = RecordingStorage::new();
        let persistoid = persistoid(PersistConfig::new("k", Arc::clone(&storage)));

        let first = tree(json!({ "a": 1 }));
        persistoid.update(&first);
        let write = persistoid.flush().unwrap();
        persistoid.update(&first.with("b", json!(2)));
        write.await;
        assert_eq!(storage.last_write().unwrap(), r#"{"a":"1"}"#);

        sleep(Duration::from_millis(5)).await;
        assert_eq!(storage.write_count(), 2);
        assert_eq!(storage.last_write().unwrap(), r#"{"a":"1","b":"2"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_tick_error_still_writes_remaining_keys() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("k", Arc::clone(&storage))
            .with_throttle(Duration::from_millis(500))
            .with_transform(
                Transform::builder("a")
                    .before_persist(|_| Err(anyhow::anyhow!("transform error").into()))
                    .build()
                    .unwrap(),
            );
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1, "b": 2, "c": 3 })));
        sleep(Duration::from_millis(510)).await;
        assert_eq!(persistoid.pending_keys(), vec!["b".to_string(), "c".to_string()]);

        let err = persistoid.flush().unwrap_err();
        assert!(err.to_string().contains("transform error"));
        assert!(persistoid.pending_keys().is_empty());

        persistoid.pending_write().await;
        assert_eq!(storage.write_count(), 1);
        assert_eq!(storage.last_write().unwrap(), r#"{"b":"2","c":"3"}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_last_key_does_not_block_the_write() {
        let storage = RecordingStorage::new();
        let config = PersistConfig::new("k", Arc::clone(&storage)).with_transform(
            Transform::builder("b")
                .before_persist(|_| Err(anyhow::anyhow!("transform error").into()))
                .build()
                .unwrap(),
        );
        let persistoid = persistoid(config);

        persistoid.update(&tree(json!({ "a": 1, "b": 2 })));
        assert!(persistoid.flush().is_err());
        persistoid.pending_write().await;

        assert_eq!(storage.last_write().unwrap(), r#"{"a":"1"}"#);
    }

    #[test]
    fn test_create_validates_config() {
        let config = PersistConfig::new("", crate::memory::MemoryStorage::new());
        assert!(matches!(create_persistoid(config), Err(PersistError::MissingKey)));
    }
}
