//! Rehydra persistence engine
//!
//! Wraps reducers so their state is loaded from a key/value storage when the
//! store activates persistence, and written back incrementally as it changes.
//! Each persisted sub-tree lives under its own storage key as one blob mapping
//! top-level keys to individually serialized values.

pub mod codec;
pub mod config;
pub mod memory;
pub mod migrate;
pub mod persistent;
pub mod persistoid;
pub mod persistor;
pub mod reconciler;
pub mod reducer;
pub mod stored;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::*;
pub use config::*;
pub use memory::*;
pub use migrate::*;
pub use persistent::*;
pub use persistoid::*;
pub use persistor::*;
pub use reconciler::*;
pub use reducer::*;
pub use stored::*;
pub use transform::*;
