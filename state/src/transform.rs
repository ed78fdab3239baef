//! Per-key transform pipeline
//!
//! A transform rewrites one top-level substate on its way to storage and/or on
//! its way back. Transforms apply in registration order before persisting and in
//! reverse order before rehydrating, so a chain of inverse pairs round-trips.

use rehydra_core::{PersistError, PersistResult};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Rewrites a substate; `None` drops it
pub type TransformFn = Arc<dyn Fn(Value) -> PersistResult<Option<Value>> + Send + Sync>;

/// Which way data is flowing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Live state on its way to storage
    BeforePersist,
    /// Stored state on its way back into live state
    BeforeRehydrate,
}

/// Transform bound to one top-level key
#[derive(Clone)]
pub struct Transform {
    reducer_name: String,
    before_persist: Option<TransformFn>,
    before_rehydrate: Option<TransformFn>,
}

impl Transform {
    pub fn builder(reducer_name: impl Into<String>) -> TransformBuilder {
        TransformBuilder {
            reducer_name: reducer_name.into(),
            before_persist: None,
            before_rehydrate: None,
        }
    }

    pub fn reducer_name(&self) -> &str {
        &self.reducer_name
    }

    fn hook(&self, direction: Direction) -> Option<&TransformFn> {
        match direction {
            Direction::BeforePersist => self.before_persist.as_ref(),
            Direction::BeforeRehydrate => self.before_rehydrate.as_ref(),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("reducer_name", &self.reducer_name)
            .field("before_persist", &self.before_persist.is_some())
            .field("before_rehydrate", &self.before_rehydrate.is_some())
            .finish()
    }
}

pub struct TransformBuilder {
    reducer_name: String,
    before_persist: Option<TransformFn>,
    before_rehydrate: Option<TransformFn>,
}

impl TransformBuilder {
    pub fn before_persist<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> PersistResult<Option<Value>> + Send + Sync + 'static,
    {
        self.before_persist = Some(Arc::new(f));
        self
    }

    pub fn before_rehydrate<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> PersistResult<Option<Value>> + Send + Sync + 'static,
    {
        self.before_rehydrate = Some(Arc::new(f));
        self
    }

    /// Fails when neither direction was supplied
    pub fn build(self) -> PersistResult<Transform> {
        if self.before_persist.is_none() && self.before_rehydrate.is_none() {
            return Err(PersistError::EmptyTransform(self.reducer_name));
        }
        Ok(Transform {
            reducer_name: self.reducer_name,
            before_persist: self.before_persist,
            before_rehydrate: self.before_rehydrate,
        })
    }
}

/// Run every transform registered for `key` over `state`.
///
/// A transform returning `None` ends the chain with `None`.
pub fn run_transforms(
    transforms: &[Transform],
    key: &str,
    direction: Direction,
    state: Value,
) -> PersistResult<Option<Value>> {
    let matching: Vec<&Transform> = transforms
        .iter()
        .filter(|t| t.reducer_name == key)
        .collect();

    let ordered: Box<dyn Iterator<Item = &&Transform>> = match direction {
        Direction::BeforePersist => Box::new(matching.iter()),
        Direction::BeforeRehydrate => Box::new(matching.iter().rev()),
    };

    let mut current = state;
    for transform in ordered {
        let Some(hook) = transform.hook(direction) else {
            continue;
        };
        match hook(current)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}
