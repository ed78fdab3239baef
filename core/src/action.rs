//! Lifecycle action vocabulary
//!
//! These are the only action shapes the persistence layer recognizes. Anything
//! else travels as [`Action::Custom`] and is handed to the base reducer untouched.

use crate::error::{PersistError, PersistResult};
use crate::traits::LifecycleHandle;
use crate::types::InboundState;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

pub const PERSIST: &str = "persist/PERSIST";
pub const PURGE: &str = "persist/PURGE";
pub const FLUSH: &str = "persist/FLUSH";
pub const PAUSE: &str = "persist/PAUSE";
pub const REHYDRATE: &str = "persist/REHYDRATE";

/// Kinds of every lifecycle action
pub const ALL_PERSIST_ACTIONS: [&str; 5] = [PERSIST, PURGE, FLUSH, PAUSE, REHYDRATE];

/// Pending result pushed by one persisted sub-tree
pub type Completion = BoxFuture<'static, PersistResult<()>>;

/// Response channel carried by purge and flush actions
///
/// Each persisted sub-tree that sees the action pushes one completion. The
/// dispatcher awaits them all with [`Completions::join`].
#[derive(Clone, Default)]
pub struct Completions {
    pending: Arc<Mutex<Vec<Completion>>>,
}

impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&self, completion: F)
    where
        F: Future<Output = PersistResult<()>> + Send + 'static,
    {
        self.pending.lock().push(completion.boxed());
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Wait for every pushed completion; the first error wins
    pub async fn join(&self) -> PersistResult<()> {
        let pending = std::mem::take(&mut *self.pending.lock());
        future::join_all(pending)
            .await
            .into_iter()
            .collect::<PersistResult<Vec<()>>>()
            .map(|_| ())
    }
}

impl fmt::Debug for Completions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completions")
            .field("pending", &self.len())
            .finish()
    }
}

/// Delivery of loaded state for one logical key
#[derive(Debug, Clone)]
pub struct RehydrateAction {
    pub key: String,
    pub payload: Option<InboundState>,
    pub err: Option<Arc<PersistError>>,
}

/// Application action, opaque to the persistence layer
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAction {
    pub kind: String,
    pub payload: Value,
}

/// Action dispatched on the external store
#[derive(Clone)]
pub enum Action {
    /// Activate persistence; carries the register/rehydrate channel
    Persist(LifecycleHandle),
    /// Remove stored state
    Purge(Completions),
    /// Write all pending state now
    Flush(Completions),
    /// Stop forwarding state to storage
    Pause,
    /// Loaded state is ready for a key
    Rehydrate(RehydrateAction),
    Custom(CustomAction),
}

impl Action {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::with_payload(kind, Value::Null)
    }

    pub fn with_payload(kind: impl Into<String>, payload: Value) -> Self {
        Action::Custom(CustomAction {
            kind: kind.into(),
            payload,
        })
    }

    pub fn rehydrate(key: impl Into<String>, payload: Option<InboundState>) -> Self {
        Action::Rehydrate(RehydrateAction {
            key: key.into(),
            payload,
            err: None,
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            Action::Persist(_) => PERSIST,
            Action::Purge(_) => PURGE,
            Action::Flush(_) => FLUSH,
            Action::Pause => PAUSE,
            Action::Rehydrate(_) => REHYDRATE,
            Action::Custom(custom) => &custom.kind,
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Action::Custom(_))
    }

    /// Payload of a custom action
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Action::Custom(custom) => Some(&custom.payload),
            _ => None,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Rehydrate(rehydrate) => f
                .debug_struct(REHYDRATE)
                .field("key", &rehydrate.key)
                .field("has_payload", &rehydrate.payload.is_some())
                .field("err", &rehydrate.err)
                .finish(),
            Action::Custom(custom) => f
                .debug_struct(&custom.kind)
                .field("payload", &custom.payload)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}
