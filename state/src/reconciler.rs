//! State reconciliation strategies
//!
//! Loaded state arrives asynchronously. By then the base reducer may already
//! have changed some substates on its own; those local changes win. A substate
//! counts as changed when the reducer's output no longer shares its identity
//! with the state the reducer was given.

use rehydra_core::{InboundState, MergeDepth, SameRef, StateTree, Substate, PERSIST_KEY};
use std::sync::Arc;
use tracing::debug;

/// Merges inbound (loaded) state into freshly reduced state
pub trait StateReconciler: Send + Sync {
    fn reconcile(
        &self,
        inbound: &InboundState,
        original: Option<&StateTree>,
        reduced: &StateTree,
    ) -> StateTree;
}

/// Replace each unmodified top-level substate wholesale
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMergeLevel1 {
    /// Log skipped and rehydrated keys
    pub debug: bool,
}

/// Shallow-merge into unmodified object substates, replace anything else
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoMergeLevel2 {
    /// Log skipped and rehydrated keys
    pub debug: bool,
}

/// Strategy for a configured depth; `debug` enables its logs
pub fn reconciler_for(depth: MergeDepth, debug: bool) -> Arc<dyn StateReconciler> {
    match depth {
        MergeDepth::One => Arc::new(AutoMergeLevel1 { debug }),
        MergeDepth::Two => Arc::new(AutoMergeLevel2 { debug }),
    }
}

fn modified_locally(key: &str, original: Option<&StateTree>, reduced: &StateTree) -> bool {
    let before = original.and_then(|state| state.get(key));
    !before.same_ref(&reduced.get(key))
}

fn reconcile_with<F>(
    inbound: &InboundState,
    original: Option<&StateTree>,
    reduced: &StateTree,
    log: bool,
    merge: F,
) -> StateTree
where
    F: Fn(&str, Option<&Substate>, &serde_json::Value) -> Substate,
{
    let mut slots = reduced.slots().clone();
    for (key, incoming) in inbound {
        if key == PERSIST_KEY {
            continue;
        }
        if modified_locally(key, original, reduced) {
            if log {
                debug!("sub state for key `{}` modified, skipping", key);
            }
            continue;
        }
        slots.insert(key.clone(), merge(key, reduced.get(key), incoming));
    }
    if log {
        debug!(
            "rehydrated keys '{}'",
            inbound.keys().cloned().collect::<Vec<_>>().join(", ")
        );
    }
    StateTree::from_slots(slots)
}

impl StateReconciler for AutoMergeLevel1 {
    fn reconcile(
        &self,
        inbound: &InboundState,
        original: Option<&StateTree>,
        reduced: &StateTree,
    ) -> StateTree {
        reconcile_with(inbound, original, reduced, self.debug, |_, _, incoming| {
            Substate::new(incoming.clone())
        })
    }
}

impl StateReconciler for AutoMergeLevel2 {
    fn reconcile(
        &self,
        inbound: &InboundState,
        original: Option<&StateTree>,
        reduced: &StateTree,
    ) -> StateTree {
        reconcile_with(inbound, original, reduced, self.debug, |_, current, incoming| {
            match (current, incoming.as_object()) {
                (Some(current), Some(fields)) if current.is_plain_object() => current
                    .merge_fields(fields)
                    .unwrap_or_else(|| current.clone()),
                (Some(current), None) if current.is_plain_object() => current.clone(),
                _ => Substate::new(incoming.clone()),
            }
        })
    }
}
