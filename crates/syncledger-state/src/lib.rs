//! Connection state and attempt stats persistence.
//!
//! Provides the [`StateApi`] and [`AttemptApi`] contracts the checkpoint
//! flusher writes through, and a [`SqliteStateStore`] implementing both.

#![warn(clippy::pedantic)]

pub mod api;
pub mod error;
pub mod sqlite;

pub use api::{AttemptApi, StateApi};
pub use error::StateError;
pub use sqlite::SqliteStateStore;

/// Common imports for consumers of this crate.
pub mod prelude {
    pub use crate::api::{AttemptApi, StateApi};
    pub use crate::error::StateError;
    pub use crate::sqlite::SqliteStateStore;
    pub use syncledger_types::state::{StateType, StateWrapper, StreamStateEntry};
    pub use syncledger_types::stats::{SaveStatsRequest, StreamSyncStats, SyncStats};
    pub use syncledger_types::stream::{AttemptContext, ConnectionId, StreamKey};
}
