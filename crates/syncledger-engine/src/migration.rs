//! Legacy to per-stream state migration checks.

use std::collections::HashSet;

use syncledger_types::catalog::ConfiguredCatalog;
use syncledger_types::state::{StateType, StateWrapper};

use crate::errors::{PersistenceError, Result};

/// Whether writing `incoming` over `stored` migrates legacy state to
/// per-stream state.
#[must_use]
pub fn is_stream_migration(stored: Option<StateType>, incoming: StateType) -> bool {
    stored == Some(StateType::Legacy) && incoming == StateType::Stream
}

/// Check that a per-stream document replacing legacy state covers every
/// incremental stream of the catalog.
///
/// Non-STREAM documents are not checked.
///
/// # Errors
///
/// Returns [`PersistenceError::MigrationIncomplete`] naming the first
/// incremental stream without state.
pub fn validate_stream_migration(state: &StateWrapper, catalog: &ConfiguredCatalog) -> Result<()> {
    if state.state_type() != StateType::Stream {
        return Ok(());
    }
    let covered: HashSet<_> = state.stream_keys().into_iter().collect();
    match catalog.incremental_streams().find(|s| !covered.contains(s)) {
        Some(missing) => Err(PersistenceError::MigrationIncomplete {
            stream: missing.clone(),
        }),
        None => Ok(()),
    }
}
