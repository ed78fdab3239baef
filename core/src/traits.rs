//! Core traits defining rehydra interfaces
//!
//! The persistence layer never owns the store, the storage backend or the
//! application reducers. These traits are the contracts it needs from them.

use crate::action::Action;
use crate::error::{PersistError, PersistResult};
use crate::types::{InboundState, StateTree};
use async_trait::async_trait;
use std::sync::Arc;

/// Key/value storage backend
///
/// Synchronous backends implement the methods without awaiting anything.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a value; `None` when the key was never written
    async fn get_item(&self, key: &str) -> PersistResult<Option<String>>;

    /// Write a value
    async fn set_item(&self, key: &str, value: String) -> PersistResult<()>;

    /// Remove a value
    async fn remove_item(&self, key: &str) -> PersistResult<()>;
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Arc<S> {
    async fn get_item(&self, key: &str) -> PersistResult<Option<String>> {
        (**self).get_item(key).await
    }

    async fn set_item(&self, key: &str, value: String) -> PersistResult<()> {
        (**self).set_item(key, value).await
    }

    async fn remove_item(&self, key: &str) -> PersistResult<()> {
        (**self).remove_item(key).await
    }
}

/// Synchronous state transition
///
/// Returning a tree that is [`SameRef`](crate::types::SameRef) to the input
/// signals "nothing changed".
pub trait Reducer: Send + Sync {
    fn reduce(&self, state: Option<StateTree>, action: &Action) -> StateTree;
}

impl<F> Reducer for F
where
    F: Fn(Option<StateTree>, &Action) -> StateTree + Send + Sync,
{
    fn reduce(&self, state: Option<StateTree>, action: &Action) -> StateTree {
        self(state, action)
    }
}

/// The external store, seen from the persistor
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, action: Action);
}

/// Channel a persisted reducer uses to report its activation progress
pub trait Lifecycle: Send + Sync {
    /// A sub-tree started loading
    fn register(&self, key: &str);

    /// A sub-tree finished loading
    fn rehydrate(&self, key: &str, payload: Option<InboundState>, err: Option<Arc<PersistError>>);
}

/// Shared handle to a [`Lifecycle`] implementation
pub type LifecycleHandle = Arc<dyn Lifecycle>;
