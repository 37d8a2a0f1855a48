//! Configured catalog types.
//!
//! A [`ConfiguredCatalog`] is the set of streams selected for a connection,
//! each with the sync mode it runs in.

use serde::{Deserialize, Serialize};

use crate::stream::StreamKey;

/// How a stream is read from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    FullRefresh,
    Incremental,
}

/// A stream selected for replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: StreamKey,
    pub sync_mode: SyncMode,
}

impl ConfiguredStream {
    #[must_use]
    pub fn new(stream: StreamKey, sync_mode: SyncMode) -> Self {
        Self { stream, sync_mode }
    }
}

/// Streams configured for a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    #[must_use]
    pub fn new(streams: Vec<ConfiguredStream>) -> Self {
        Self { streams }
    }

    /// Streams that carry state between runs.
    pub fn incremental_streams(&self) -> impl Iterator<Item = &StreamKey> {
        self.streams
            .iter()
            .filter(|s| s.sync_mode == SyncMode::Incremental)
            .map(|s| &s.stream)
    }
}
