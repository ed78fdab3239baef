//! Store-wide persistence control
//!
//! The persistor activates every persisted sub-tree of a store, tracks which of
//! them are still loading and fans purge and flush out to all of them.

use parking_lot::Mutex;
use rehydra_core::{
    Action, Completions, Dispatch, InboundState, Lifecycle, PersistError, PersistResult,
    PersistorOptions, RehydrateAction,
};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info};

/// Registry bookkeeping action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistorAction {
    /// A sub-tree started loading
    Register(String),
    /// A sub-tree finished loading
    Rehydrate(String),
}

/// Keys still loading, and whether every sub-tree has loaded once
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PersistorState {
    pub registry: Vec<String>,
    pub bootstrapped: bool,
}

/// Registry transition.
///
/// `Rehydrate` removes one occurrence of its key and recomputes the flag from
/// the remaining registry. `Register` leaves the flag as it was.
pub fn persistor_reducer(state: &PersistorState, action: &PersistorAction) -> PersistorState {
    match action {
        PersistorAction::Register(key) => {
            let mut registry = state.registry.clone();
            registry.push(key.clone());
            PersistorState {
                registry,
                bootstrapped: state.bootstrapped,
            }
        }
        PersistorAction::Rehydrate(key) => {
            let mut registry = state.registry.clone();
            if let Some(index) = registry.iter().position(|k| k == key) {
                registry.remove(index);
            }
            let bootstrapped = registry.is_empty();
            PersistorState {
                registry,
                bootstrapped,
            }
        }
    }
}

/// Called once, when the store is bootstrapped
pub type BootstrappedCallback = Box<dyn FnOnce() + Send>;

/// Persistence controller for one store
pub struct Persistor {
    store: Arc<dyn Dispatch>,
    state: Mutex<PersistorState>,
    bootstrapped_tx: watch::Sender<bool>,
    on_bootstrapped: Mutex<Option<BootstrappedCallback>>,
    this: Weak<Persistor>,
}

/// Create the persistor of `store` and, unless `manual_persist` is set,
/// activate persistence right away.
pub fn persist_store(
    store: Arc<dyn Dispatch>,
    options: PersistorOptions,
    on_bootstrapped: Option<BootstrappedCallback>,
) -> Arc<Persistor> {
    let (bootstrapped_tx, _) = watch::channel(false);
    let persistor = Arc::new_cyclic(|this| Persistor {
        store,
        state: Mutex::new(PersistorState::default()),
        bootstrapped_tx,
        on_bootstrapped: Mutex::new(on_bootstrapped),
        this: this.clone(),
    });

    if !options.manual_persist {
        persistor.persist();
    }
    persistor
}

impl Persistor {
    /// Activate (or resume) persistence of every sub-tree
    pub fn persist(&self) {
        if let Some(this) = self.this.upgrade() {
            info!("Activating persistence");
            self.store.dispatch(Action::Persist(this));
        }
    }

    /// Stop forwarding state to storage
    pub fn pause(&self) {
        self.store.dispatch(Action::Pause);
    }

    /// Remove the stored state of every sub-tree
    pub async fn purge(&self) -> PersistResult<()> {
        let completions = Completions::new();
        self.store.dispatch(Action::Purge(completions.clone()));
        completions.join().await
    }

    /// Write all pending state of every sub-tree
    pub async fn flush(&self) -> PersistResult<()> {
        let completions = Completions::new();
        self.store.dispatch(Action::Flush(completions.clone()));
        completions.join().await
    }

    pub fn state(&self) -> PersistorState {
        self.state.lock().clone()
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.state.lock().bootstrapped
    }

    /// Resolves once every registered sub-tree has loaded
    pub async fn bootstrapped(&self) {
        let mut rx = self.bootstrapped_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    fn apply(&self, action: PersistorAction) -> PersistorState {
        let mut state = self.state.lock();
        *state = persistor_reducer(&state, &action);
        state.clone()
    }
}

impl Lifecycle for Persistor {
    fn register(&self, key: &str) {
        debug!("Registering {}", key);
        self.apply(PersistorAction::Register(key.to_string()));
    }

    fn rehydrate(&self, key: &str, payload: Option<InboundState>, err: Option<Arc<PersistError>>) {
        self.store.dispatch(Action::Rehydrate(RehydrateAction {
            key: key.to_string(),
            payload,
            err,
        }));

        let state = self.apply(PersistorAction::Rehydrate(key.to_string()));
        self.bootstrapped_tx.send_replace(state.bootstrapped);
        if state.bootstrapped {
            let callback = self.on_bootstrapped.lock().take();
            if let Some(callback) = callback {
                info!("Store bootstrapped");
                callback();
            }
        }
    }
}
