//! Remote state and stats API contracts.
//!
//! Both traits are synchronous and object-safe. Callers on an async runtime
//! drive them from the blocking pool.

use syncledger_types::state::StateWrapper;
use syncledger_types::stats::SaveStatsRequest;
use syncledger_types::stream::ConnectionId;

use crate::error;

/// Per-connection state storage.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateApi>`.
pub trait StateApi: Send + Sync {
    /// Read the stored state document for a connection.
    ///
    /// Returns `Ok(None)` when nothing has been stored yet.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_state(&self, connection: &ConnectionId) -> error::Result<Option<StateWrapper>>;

    /// Store `state` for a connection.
    ///
    /// STREAM documents merge per stream into what is already stored; other
    /// shapes replace the stored document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn create_or_update_state(
        &self,
        connection: &ConnectionId,
        state: &StateWrapper,
    ) -> error::Result<()>;
}

/// Per-attempt stats storage.
pub trait AttemptApi: Send + Sync {
    /// Upsert the stats of one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn save_stats(&self, request: &SaveStatsRequest) -> error::Result<()>;
}
