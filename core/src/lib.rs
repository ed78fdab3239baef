//! rehydra Core Library
//!
//! Core types, traits, and abstractions shared by the rehydra persistence engine.
//! This crate provides the state tree model, the lifecycle action vocabulary and
//! the seams (storage, reducer, dispatch) the engine is built against.

pub mod types;
pub mod action;
pub mod traits;
pub mod error;
pub mod config;

pub use types::*;
pub use action::*;
pub use traits::*;
pub use error::*;
pub use config::*;
