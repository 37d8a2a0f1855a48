//! Record and estimate messages observed on the source stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::StreamKey;

/// A single record emitted by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: StreamKey,
    pub data: Value,
    /// Size of the transferred file, for file-based records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
}

impl RecordMessage {
    #[must_use]
    pub fn new(stream: StreamKey, data: Value) -> Self {
        Self {
            stream,
            data,
            file_size_bytes: None,
        }
    }

    /// Bytes this record counts for: the file size when present, else the
    /// serialized length of `data`.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.file_size_bytes
            .unwrap_or_else(|| self.data.to_string().len() as u64)
    }
}

/// Source-supplied estimate of how much data a sync will move.
///
/// Estimates are snapshots: a newer one replaces the previous value for the
/// same scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EstimateMessage {
    /// Estimate for one stream.
    Stream {
        stream: StreamKey,
        row_estimate: u64,
        byte_estimate: u64,
    },
    /// Estimate for the sync as a whole.
    Sync { row_estimate: u64, byte_estimate: u64 },
}
