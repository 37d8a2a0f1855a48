//! Checkpoint and stats bookkeeping for a single replication attempt.
//!
//! [`StreamStatsTracker`] reconciles what a source emitted against what a
//! destination acknowledged. [`SyncPersistence`] buffers checkpoints and
//! flushes them, together with the tracker's stats, to the remote state and
//! stats APIs.

#![warn(clippy::pedantic)]

pub mod aggregator;
pub mod bookkeeping;
pub mod clock;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod migration;
pub mod persistence;
pub mod retry;

pub use bookkeeping::{ChecksumMismatch, CheckpointOrigin, StreamStatsTracker};
pub use errors::PersistenceError;
pub use persistence::{SyncPersistence, SyncPersistenceConfig, SyncPersistenceDeps};
pub use retry::RetryPolicy;
