//! Test fixtures: storages with scripted behaviour, a minimal store and reducers

use crate::memory::MemoryStorage;
use async_trait::async_trait;
use parking_lot::Mutex;
use rehydra_core::{
    Action, Dispatch, InboundState, Lifecycle, PersistError, PersistResult, Reducer, SameRef,
    StateTree, Storage,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;

/// Memory storage that records every write
#[derive(Default)]
pub struct RecordingStorage {
    pub inner: MemoryStorage,
    writes: Mutex<Vec<(String, String)>>,
}

impl RecordingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn last_write(&self) -> Option<String> {
        self.writes.lock().last().map(|(_, value)| value.clone())
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn get_item(&self, key: &str) -> PersistResult<Option<String>> {
        self.inner.get_item(key).await
    }

    async fn set_item(&self, key: &str, value: String) -> PersistResult<()> {
        self.writes.lock().push((key.to_string(), value.clone()));
        self.inner.set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> PersistResult<()> {
        self.inner.remove_item(key).await
    }
}

/// Storage whose reads never complete
#[derive(Default)]
pub struct NeverStorage;

#[async_trait]
impl Storage for NeverStorage {
    async fn get_item(&self, _key: &str) -> PersistResult<Option<String>> {
        futures::future::pending().await
    }

    async fn set_item(&self, _key: &str, _value: String) -> PersistResult<()> {
        Ok(())
    }

    async fn remove_item(&self, _key: &str) -> PersistResult<()> {
        Ok(())
    }
}

/// Storage whose reads never complete; counts reads dropped unfinished
#[derive(Default)]
pub struct HangingStorage {
    abandoned: Arc<AtomicUsize>,
}

struct ReadGuard(Arc<AtomicUsize>);

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl HangingStorage {
    pub fn abandoned_reads(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Storage for HangingStorage {
    async fn get_item(&self, _key: &str) -> PersistResult<Option<String>> {
        let _guard = ReadGuard(Arc::clone(&self.abandoned));
        futures::future::pending().await
    }

    async fn set_item(&self, _key: &str, _value: String) -> PersistResult<()> {
        Ok(())
    }

    async fn remove_item(&self, _key: &str) -> PersistResult<()> {
        Ok(())
    }
}

/// Storage failing every operation; counts write attempts
#[derive(Default)]
pub struct BrokenStorage {
    write_attempts: Mutex<usize>,
}

impl BrokenStorage {
    pub fn write_attempts(&self) -> usize {
        *self.write_attempts.lock()
    }
}

#[async_trait]
impl Storage for BrokenStorage {
    async fn get_item(&self, _key: &str) -> PersistResult<Option<String>> {
        Err(PersistError::Storage("storage read error".into()))
    }

    async fn set_item(&self, _key: &str, _value: String) -> PersistResult<()> {
        *self.write_attempts.lock() += 1;
        Err(PersistError::Storage("storage write error".into()))
    }

    async fn remove_item(&self, _key: &str) -> PersistResult<()> {
        Err(PersistError::Storage("storage remove error".into()))
    }
}

/// Lifecycle handle recording every call
#[derive(Default)]
pub struct RecordingLifecycle {
    pub registered: Mutex<Vec<String>>,
    pub rehydrated: Mutex<Vec<(String, Option<InboundState>)>>,
}

impl RecordingLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn rehydrate_count(&self) -> usize {
        self.rehydrated.lock().len()
    }
}

impl Lifecycle for RecordingLifecycle {
    fn register(&self, key: &str) {
        self.registered.lock().push(key.to_string());
    }

    fn rehydrate(&self, key: &str, payload: Option<InboundState>, _err: Option<Arc<PersistError>>) {
        self.rehydrated.lock().push((key.to_string(), payload));
    }
}

/// Single-reducer store with synchronous dispatch
pub struct TestStore {
    reducer: Box<dyn Reducer>,
    state: Mutex<Option<StateTree>>,
}

impl TestStore {
    pub fn new<R: Reducer + 'static>(reducer: R) -> Arc<Self> {
        let state = reducer.reduce(None, &Action::custom("@@INIT"));
        Arc::new(Self {
            reducer: Box::new(reducer),
            state: Mutex::new(Some(state)),
        })
    }

    pub fn state(&self) -> StateTree {
        self.state.lock().clone().unwrap_or_default()
    }
}

impl Dispatch for TestStore {
    fn dispatch(&self, action: Action) {
        let mut state = self.state.lock();
        let next = self.reducer.reduce(state.take(), &action);
        *state = Some(next);
    }
}

/// Combine named reducers into one tree, each owning the slot of its name
pub fn combine(reducers: Vec<(&'static str, Box<dyn Reducer>)>) -> impl Reducer {
    move |state: Option<StateTree>, action: &Action| {
        let mut changed = state.is_none();
        let mut slots = BTreeMap::new();
        for (name, reducer) in &reducers {
            let previous = state
                .as_ref()
                .and_then(|s| s.get(name))
                .and_then(|s| s.as_tree())
                .cloned();
            let next = reducer.reduce(previous.clone(), action);
            changed |= !previous.as_ref().is_some_and(|p| p.same_ref(&next));
            slots.insert(name.to_string(), next.into());
        }
        match state {
            Some(state) if !changed => state,
            _ => StateTree::from_slots(slots),
        }
    }
}

/// `{ "value": n }`, incremented by `INCREMENT`
pub fn counter(state: Option<StateTree>, action: &Action) -> StateTree {
    let state = state.unwrap_or_else(|| StateTree::new().with("value", json!(0)));
    match action.kind() {
        "INCREMENT" => {
            let value = state.value("value").and_then(Value::as_i64).unwrap_or(0);
            state.with("value", json!(value + 1))
        }
        _ => state,
    }
}

/// Reducer that never changes anything
pub fn identity(state: Option<StateTree>, _action: &Action) -> StateTree {
    state.unwrap_or_default()
}

/// Route engine logs to the test harness output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("rehydra_state=debug")
        .with_test_writer()
        .try_init();
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a debug-level subscriber and return what it logged
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(buffer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
    (result, logs)
}

pub fn tree(value: Value) -> StateTree {
    StateTree::from_json(value).unwrap()
}

pub fn inbound(value: Value) -> InboundState {
    value.as_object().cloned().unwrap()
}
