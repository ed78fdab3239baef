//! Core types used throughout rehydra
//!
//! The state tree is immutable and cheap to clone. Every change produces a new
//! tree; untouched slots keep their allocation, so "did this change" is answered
//! by pointer identity ([`SameRef`]) rather than by deep comparison.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Prefix prepended to every logical key before it reaches storage
pub const KEY_PREFIX: &str = "persist:";

/// Reserved slot carrying [`PersistState`] inside a persisted tree
pub const PERSIST_KEY: &str = "_persist";

/// Version assumed when neither config nor stored data names one
pub const DEFAULT_VERSION: i64 = -1;

/// Deserialized (and hydrate-transformed) contents of a persisted blob
pub type InboundState = Map<String, Value>;

/// Identity comparison
///
/// Two values are the same when they share one allocation. This is the only
/// notion of equality the engine uses to detect change.
pub trait SameRef {
    fn same_ref(&self, other: &Self) -> bool;
}

/// Persistence metadata attached to a live state tree under `_persist`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistState {
    pub version: i64,
    pub rehydrated: bool,
}

impl PersistState {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            rehydrated: false,
        }
    }

    /// Same version, marked rehydrated
    pub fn rehydrated(self) -> Self {
        Self {
            rehydrated: true,
            ..self
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "version": self.version,
            "rehydrated": self.rehydrated,
        })
    }

    /// Read metadata back out of a JSON slot; missing fields fall back to defaults
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            version: obj
                .get("version")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_VERSION),
            rehydrated: obj
                .get("rehydrated")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// A single top-level value inside a [`StateTree`]
#[derive(Debug, Clone)]
pub enum Substate {
    /// A JSON leaf
    Value(Arc<Value>),
    /// A nested tree, e.g. the output of another persisted reducer
    Tree(StateTree),
}

impl Substate {
    pub fn new(value: Value) -> Self {
        Substate::Value(Arc::new(value))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Substate::Value(value) => Some(value.as_ref()),
            Substate::Tree(_) => None,
        }
    }

    pub fn as_tree(&self) -> Option<&StateTree> {
        match self {
            Substate::Tree(tree) => Some(tree),
            Substate::Value(_) => None,
        }
    }

    /// Non-null, non-array object
    pub fn is_plain_object(&self) -> bool {
        match self {
            Substate::Value(value) => value.is_object(),
            Substate::Tree(_) => true,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Substate::Value(value) => Value::clone(value),
            Substate::Tree(tree) => tree.to_json(),
        }
    }

    /// Shallow-merge `fields` over this substate, `fields` winning per key.
    ///
    /// Returns `None` when this substate is not a plain object.
    pub fn merge_fields(&self, fields: &Map<String, Value>) -> Option<Substate> {
        match self {
            Substate::Value(value) => {
                let mut merged = value.as_object()?.clone();
                for (key, field) in fields {
                    merged.insert(key.clone(), field.clone());
                }
                Some(Substate::new(Value::Object(merged)))
            }
            Substate::Tree(tree) => {
                let mut slots = tree.slots().clone();
                for (key, field) in fields {
                    slots.insert(key.clone(), Substate::new(field.clone()));
                }
                Some(Substate::Tree(StateTree::from_slots(slots)))
            }
        }
    }
}

impl SameRef for Substate {
    fn same_ref(&self, other: &Self) -> bool {
        match (self, other) {
            (Substate::Value(a), Substate::Value(b)) => Arc::ptr_eq(a, b),
            (Substate::Tree(a), Substate::Tree(b)) => a.same_ref(b),
            _ => false,
        }
    }
}

impl<'a, T: SameRef> SameRef for Option<&'a T> {
    fn same_ref(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.same_ref(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl From<Value> for Substate {
    fn from(value: Value) -> Self {
        Substate::new(value)
    }
}

impl From<StateTree> for Substate {
    fn from(tree: StateTree) -> Self {
        Substate::Tree(tree)
    }
}

/// Immutable mapping from top-level key to substate
#[derive(Debug, Clone, Default)]
pub struct StateTree {
    slots: Arc<BTreeMap<String, Substate>>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots(slots: BTreeMap<String, Substate>) -> Self {
        Self {
            slots: Arc::new(slots),
        }
    }

    /// Build a tree whose slots are JSON leaves
    pub fn from_json_map(map: Map<String, Value>) -> Self {
        map.into_iter()
            .map(|(key, value)| (key, Substate::new(value)))
            .collect()
    }

    /// Build a tree from a JSON object; anything else yields `None`
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self::from_json_map(map)),
            _ => None,
        }
    }

    pub fn slots(&self) -> &BTreeMap<String, Substate> {
        &self.slots
    }

    pub fn get(&self, key: &str) -> Option<&Substate> {
        self.slots.get(key)
    }

    /// JSON leaf stored at `key`
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.get(key).and_then(Substate::as_value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Substate)> {
        self.slots.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// New tree with `key` set to `value`; every other slot is shared
    pub fn with(&self, key: impl Into<String>, value: impl Into<Substate>) -> Self {
        let mut slots = BTreeMap::clone(&self.slots);
        slots.insert(key.into(), value.into());
        Self::from_slots(slots)
    }

    /// New tree without `key`
    pub fn without(&self, key: &str) -> Self {
        let mut slots = BTreeMap::clone(&self.slots);
        slots.remove(key);
        Self::from_slots(slots)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.slots
                .iter()
                .map(|(key, value)| (key.clone(), value.to_json()))
                .collect(),
        )
    }

    /// Metadata in the `_persist` slot, if any
    pub fn persist_state(&self) -> Option<PersistState> {
        self.value(PERSIST_KEY).and_then(PersistState::from_json)
    }

    pub fn with_persist(&self, meta: PersistState) -> Self {
        self.with(PERSIST_KEY, meta.to_json())
    }

    /// Separate the `_persist` slot from the rest of the tree.
    ///
    /// The returned slot keeps its identity so it can be reattached unchanged.
    pub fn split_persist(&self) -> (StateTree, Option<Substate>) {
        match self.get(PERSIST_KEY) {
            Some(slot) => (self.without(PERSIST_KEY), Some(slot.clone())),
            None => (self.clone(), None),
        }
    }
}

impl SameRef for StateTree {
    fn same_ref(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }
}

impl FromIterator<(String, Substate)> for StateTree {
    fn from_iter<I: IntoIterator<Item = (String, Substate)>>(iter: I) -> Self {
        Self::from_slots(iter.into_iter().collect())
    }
}

impl From<Map<String, Value>> for StateTree {
    fn from(map: Map<String, Value>) -> Self {
        Self::from_json_map(map)
    }
}
