//! Emitted versus committed accounting.
//!
//! [`StreamStatsTracker`] is the entry point. Checkpoint queues and timing
//! accumulators for a single scope live in `scope`; record count
//! validation of connector-annotated checkpoints lives in `checksum`.

mod checksum;
mod scope;
mod tracker;

pub use checksum::{ChecksumMismatch, CheckpointOrigin};
pub use tracker::StreamStatsTracker;
