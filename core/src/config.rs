//! Configuration types for rehydra

use crate::types::{DEFAULT_VERSION, PERSIST_KEY};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Default activation timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Data-only options of one persisted sub-tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistOptions {
    /// Logical key; stored under `persist:<key>`
    pub key: String,

    /// Target schema version
    pub version: i64,

    /// Only these top-level keys are persisted
    pub allowlist: Option<Vec<String>>,

    /// These top-level keys are never persisted
    pub blocklist: Option<Vec<String>>,

    /// Legacy name of `allowlist`
    pub whitelist: Option<Vec<String>>,

    /// Legacy name of `blocklist`
    pub blacklist: Option<Vec<String>>,

    /// Minimum interval between processing queued keys, in milliseconds
    pub throttle_ms: u64,

    /// Activation timeout in milliseconds; 0 waits forever
    pub timeout_ms: u64,

    /// How deeply loaded state is merged into live state
    pub rehydration_depth: MergeDepth,

    /// Verbose reconciliation logging
    pub debug: bool,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            key: String::new(),
            version: DEFAULT_VERSION,
            allowlist: None,
            blocklist: None,
            whitelist: None,
            blacklist: None,
            throttle_ms: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            rehydration_depth: MergeDepth::Two,
            debug: false,
        }
    }
}

impl PersistOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    /// `None` when the timeout is disabled
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Resolve legacy aliases into the canonical key filter
    pub fn key_filter(&self) -> KeyFilter {
        KeyFilter::new(
            self.allowlist.clone().or_else(|| self.whitelist.clone()),
            self.blocklist.clone().or_else(|| self.blacklist.clone()),
        )
    }
}

/// Rehydration merge depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum MergeDepth {
    /// Replace top-level substates
    One,
    /// Shallow-merge into top-level object substates
    #[default]
    Two,
}

impl TryFrom<u8> for MergeDepth {
    type Error = String;

    fn try_from(depth: u8) -> Result<Self, Self::Error> {
        match depth {
            1 => Ok(MergeDepth::One),
            2 => Ok(MergeDepth::Two),
            other => Err(format!("rehydration depth must be 1 or 2, got {other}")),
        }
    }
}

impl From<MergeDepth> for u8 {
    fn from(depth: MergeDepth) -> Self {
        match depth {
            MergeDepth::One => 1,
            MergeDepth::Two => 2,
        }
    }
}

/// Allow/block filter over top-level keys
///
/// With an allow-list only listed keys (and `_persist`) pass. A block-list
/// excludes its keys in every case, including keys also allow-listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    allow: Option<HashSet<String>>,
    block: Option<HashSet<String>>,
}

impl KeyFilter {
    pub fn new(allow: Option<Vec<String>>, block: Option<Vec<String>>) -> Self {
        Self {
            allow: allow.map(|keys| keys.into_iter().collect()),
            block: block.map(|keys| keys.into_iter().collect()),
        }
    }

    pub fn passes(&self, key: &str) -> bool {
        if let Some(allow) = &self.allow {
            if !allow.contains(key) && key != PERSIST_KEY {
                return false;
            }
        }
        if let Some(block) = &self.block {
            if block.contains(key) {
                return false;
            }
        }
        true
    }
}

/// Persistor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistorOptions {
    /// Do not activate persistence when the persistor is created
    pub manual_persist: bool,
}
