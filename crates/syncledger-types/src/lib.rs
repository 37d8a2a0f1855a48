//! Shared model types for checkpoint and stats bookkeeping.
//!
//! Pure data: stream identity, state messages, record/estimate messages,
//! stats payloads, and the configured catalog. Kept dependency-light so both
//! the state store and the engine crates can share them.

#![warn(clippy::pedantic)]

pub mod catalog;
pub mod message;
pub mod state;
pub mod stats;
pub mod stream;
