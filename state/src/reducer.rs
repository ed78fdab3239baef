//! Reducer wrapper driving the persistence lifecycle of one sub-tree
//!
//! ```text
//! unactivated --PERSIST--> activating --rehydrate--> rehydrated <--> paused
//! ```
//!
//! Activation registers the key, then loads, migrates and delivers the stored
//! state through the lifecycle handle from a spawned task. From then on every
//! state change of the wrapped reducer is forwarded to the persistoid while the
//! sub-tree is rehydrated and not paused.

use crate::config::{ErrorHook, PersistConfig};
use crate::persistoid::Persistoid;
use crate::reconciler::{reconciler_for, StateReconciler};
use crate::stored::{get_stored_state, purge_stored_state};
use parking_lot::Mutex;
use rehydra_core::{
    Action, Completions, InboundState, LifecycleHandle, PersistError, PersistResult,
    PersistState, RehydrateAction, Reducer, SameRef, StateTree, Storage, Substate, PERSIST_KEY,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

struct ReducerRuntime {
    persistoid: Option<Persistoid>,
    purge: bool,
    paused: bool,
}

/// A reducer whose state is persisted under one storage key
pub struct PersistedReducer<R> {
    config: Arc<PersistConfig>,
    storage: Arc<dyn Storage>,
    base: R,
    reconciler: Arc<dyn StateReconciler>,
    runtime: Arc<Mutex<ReducerRuntime>>,
}

/// Wrap `base` so its state is loaded from and saved to storage.
///
/// Fails when the config has no key or no storage.
pub fn persist_reducer<R: Reducer>(
    config: PersistConfig,
    base: R,
) -> PersistResult<PersistedReducer<R>> {
    config.validate()?;
    let storage = Arc::clone(config.storage()?);
    let reconciler = reconciler_for(config.options.rehydration_depth, config.options.debug);
    Ok(PersistedReducer {
        config: Arc::new(config),
        storage,
        base,
        reconciler,
        runtime: Arc::new(Mutex::new(ReducerRuntime {
            persistoid: None,
            purge: false,
            paused: true,
        })),
    })
}

fn attach(tree: StateTree, slot: Option<Substate>) -> StateTree {
    match slot {
        Some(slot) => tree.with(PERSIST_KEY, slot),
        None => tree,
    }
}

impl<R: Reducer> PersistedReducer<R> {
    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn is_paused(&self) -> bool {
        self.runtime.lock().paused
    }

    pub fn is_purging(&self) -> bool {
        self.runtime.lock().purge
    }

    fn version(&self) -> i64 {
        self.config.options.version
    }

    /// Run the base reducer over the state without its `_persist` slot
    fn reduce_rest(
        &self,
        state: &Option<StateTree>,
        rest: &StateTree,
        action: &Action,
    ) -> StateTree {
        self.base.reduce(state.as_ref().map(|_| rest.clone()), action)
    }

    /// Forward to the persistoid when rehydrated and not paused
    fn conditional_update(&self, state: StateTree) -> StateTree {
        let rehydrated = state.persist_state().is_some_and(|meta| meta.rehydrated);
        if rehydrated {
            let persistoid = {
                let runtime = self.runtime.lock();
                if runtime.paused {
                    None
                } else {
                    runtime.persistoid.clone()
                }
            };
            if let Some(persistoid) = persistoid {
                persistoid.update(&state);
            }
        }
        state
    }

    fn activate(
        &self,
        state: &Option<StateTree>,
        rest: &StateTree,
        slot: Option<Substate>,
        lifecycle: &LifecycleHandle,
        action: &Action,
    ) -> StateTree {
        {
            let mut runtime = self.runtime.lock();
            runtime.paused = false;
            if runtime.persistoid.is_none() {
                runtime.persistoid = Some(Persistoid::new(
                    Arc::clone(&self.config),
                    Arc::clone(&self.storage),
                ));
            }
        }

        if slot.is_some() {
            // already active; nested persisted reducers still see the action
            return attach(self.reduce_rest(state, rest, action), slot);
        }

        lifecycle.register(self.config.key());
        self.spawn_rehydrate(Arc::clone(lifecycle));

        self.reduce_rest(state, rest, action)
            .with_persist(PersistState::new(self.version()))
    }

    fn spawn_rehydrate(&self, lifecycle: LifecycleHandle) {
        let gate = RehydrateGate::new(
            self.config.key().to_string(),
            lifecycle,
            Arc::clone(&self.runtime),
            self.config.on_error.clone(),
        );

        if let Some(timeout) = self.config.options.timeout() {
            let timer_gate = gate.clone();
            let key = self.config.key().to_string();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timer_gate.complete(Err(PersistError::Timeout(key)));
            });
            gate.track(timer.abort_handle());
        }

        let config = Arc::clone(&self.config);
        let load_gate = gate.clone();
        let load = tokio::spawn(async move {
            let result = load_and_migrate(&config).await;
            load_gate.complete(result);
        });
        gate.track(load.abort_handle());
    }

    fn purge(&self, completions: &Completions) {
        self.runtime.lock().purge = true;
        let config = Arc::clone(&self.config);
        let task = tokio::spawn(async move { purge_stored_state(&config).await });
        completions.push(async move {
            task.await
                .map_err(|err| PersistError::Internal(err.to_string()))?
        });
    }

    fn flush(&self, completions: &Completions) {
        let Some(persistoid) = self.runtime.lock().persistoid.clone() else {
            completions.push(async { Ok(()) });
            return;
        };
        let flushed = persistoid.flush();
        let write = persistoid.pending_write();
        completions.push(async move {
            write.await;
            flushed.map(|_| ())
        });
    }

    fn rehydrate(
        &self,
        state: &Option<StateTree>,
        rest: StateTree,
        slot: Option<Substate>,
        rehydrate: &RehydrateAction,
        action: &Action,
    ) -> StateTree {
        let meta = slot
            .as_ref()
            .and_then(Substate::as_value)
            .and_then(PersistState::from_json)
            .unwrap_or_else(|| PersistState::new(self.version()))
            .rehydrated();

        let reduced = self.reduce_rest(state, &rest, action);
        let reconciled = match &rehydrate.payload {
            Some(inbound) => {
                if self.config.options.debug {
                    debug!(
                        "Reconciling {} inbound keys for {}",
                        inbound.len(),
                        self.config.key()
                    );
                }
                self.reconciler.reconcile(inbound, state.as_ref(), &reduced)
            }
            None => reduced,
        };

        self.conditional_update(reconciled.with_persist(meta))
    }
}

impl<R: Reducer> Reducer for PersistedReducer<R> {
    fn reduce(&self, state: Option<StateTree>, action: &Action) -> StateTree {
        let (rest, slot) = match &state {
            Some(state) => state.split_persist(),
            None => (StateTree::new(), None),
        };

        match action {
            Action::Persist(lifecycle) => {
                return self.activate(&state, &rest, slot, lifecycle, action);
            }
            Action::Purge(completions) => {
                self.purge(completions);
                return attach(self.reduce_rest(&state, &rest, action), slot);
            }
            Action::Flush(completions) => {
                self.flush(completions);
                return attach(self.reduce_rest(&state, &rest, action), slot);
            }
            Action::Pause => {
                self.runtime.lock().paused = true;
            }
            Action::Rehydrate(rehydrate) => {
                if self.is_purging() {
                    let meta = slot
                        .as_ref()
                        .and_then(Substate::as_value)
                        .and_then(PersistState::from_json)
                        .unwrap_or_else(|| PersistState::new(self.version()));
                    return rest.with_persist(meta.rehydrated());
                }
                if rehydrate.key == self.config.key() {
                    return self.rehydrate(&state, rest, slot, rehydrate, action);
                }
            }
            Action::Custom(_) => {}
        }

        match (state, slot) {
            (Some(original), Some(slot)) => {
                let next = self.base.reduce(Some(rest.clone()), action);
                if next.same_ref(&rest) {
                    return original;
                }
                self.conditional_update(next.with(PERSIST_KEY, slot))
            }
            // not activated yet
            (state, _) => self.base.reduce(state, action),
        }
    }
}

async fn load_and_migrate(config: &PersistConfig) -> PersistResult<Option<InboundState>> {
    let restored = get_stored_state(config).await?;
    match &config.migrate {
        Some(migrate) => migrate
            .migrate(restored, config.options.version)
            .await
            .map_err(|err| {
                error!("Migration error: {}", err);
                err
            }),
        None => Ok(restored),
    }
}

/// Single-shot delivery of one activation's outcome
#[derive(Clone)]
struct RehydrateGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    key: String,
    sealed: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
    lifecycle: LifecycleHandle,
    runtime: Arc<Mutex<ReducerRuntime>>,
    on_error: Option<ErrorHook>,
}

impl RehydrateGate {
    fn new(
        key: String,
        lifecycle: LifecycleHandle,
        runtime: Arc<Mutex<ReducerRuntime>>,
        on_error: Option<ErrorHook>,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                key,
                sealed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                lifecycle,
                runtime,
                on_error,
            }),
        }
    }

    /// Abort `task` once the gate seals, or right away if it already has
    fn track(&self, task: AbortHandle) {
        let mut tasks = self.inner.tasks.lock();
        if self.inner.sealed.load(Ordering::SeqCst) {
            task.abort();
        } else {
            tasks.push(task);
        }
    }

    /// First call wins; later calls are logged and dropped
    fn complete(&self, result: PersistResult<Option<InboundState>>) {
        let key = &self.inner.key;
        if self.inner.sealed.swap(true, Ordering::SeqCst) {
            match &result {
                Ok(_) => warn!("rehydrate for \"{}\" called after it was sealed", key),
                Err(err) => warn!("rehydrate for \"{}\" called after it was sealed: {}", key, err),
            }
            return;
        }
        // abort whichever of the timer and load tasks lost
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }

        match result {
            Ok(payload) => self.inner.lifecycle.rehydrate(key, payload, None),
            Err(err) => {
                error!("Not rehydrating \"{}\" due to {}", key, err);
                self.inner.runtime.lock().paused = true;
                if let Some(on_error) = self.inner.on_error.clone() {
                    tokio::spawn(async move { on_error(&err) });
                }
            }
        }
    }
}
