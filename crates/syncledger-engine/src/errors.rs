//! Errors surfaced by [`SyncPersistence`](crate::SyncPersistence).
//!
//! Scheduled flush failures never reach the caller; they are retried on the
//! next tick. Only misuse and terminal flush failures are returned.

use syncledger_state::StateError;
use syncledger_types::stream::{ConnectionId, StreamKey};

use crate::bookkeeping::ChecksumMismatch;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// `persist` was called with a connection id other than the bound one.
    #[error("state for connection {got} cannot be persisted by the flusher bound to {expected}")]
    InvalidConnection {
        expected: ConnectionId,
        got: ConnectionId,
    },

    /// The flusher has already been closed.
    #[error("sync persistence is closed")]
    Closed,

    /// Every attempt of the final state write failed.
    #[error("failed to persist state after {attempts} attempts: {source}")]
    StateFlushExhausted {
        attempts: u32,
        #[source]
        source: StateError,
    },

    /// Every attempt of the final stats write failed.
    #[error("failed to persist stats after {attempts} attempts: {source}")]
    StatsFlushExhausted {
        attempts: u32,
        #[source]
        source: StateError,
    },

    /// A legacy to per-stream migration would leave an incremental stream
    /// without state. The attempt must be retried.
    #[error("legacy state migration incomplete: no state for incremental stream {stream}")]
    MigrationIncomplete { stream: StreamKey },

    /// Connector record counts disagree with the platform count.
    #[error("invalid state checksum: {0}")]
    InvalidChecksum(#[source] ChecksumMismatch),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("sync persistence lock poisoned")]
    LockPoisoned,
}

impl PersistenceError {
    /// Whether the attempt must be treated as failed: its committed state is
    /// unknown or incomplete.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StateFlushExhausted { .. }
                | Self::StatsFlushExhausted { .. }
                | Self::MigrationIncomplete { .. }
                | Self::InvalidChecksum(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
