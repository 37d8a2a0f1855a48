//! Stats payloads reported to the attempt stats API.

use serde::{Deserialize, Serialize};

use crate::stream::{AttemptContext, StreamKey};

/// Emitted/committed/estimated totals for a sync or a single stream.
///
/// `*_committed` is `None` when no checkpoint has been processed yet, which
/// distinguishes "nothing committed" from "unknown". Estimates are `None`
/// when no estimate applies. Records the destination reported as rejected
/// are excluded from `records_committed` and counted in `records_rejected`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub records_emitted: u64,
    pub bytes_emitted: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_committed: Option<u64>,
    #[serde(default)]
    pub records_rejected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_committed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_records: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_bytes: Option<u64>,
}

/// Per-stream stats row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSyncStats {
    pub stream: StreamKey,
    pub stats: SyncStats,
}

/// Payload for a single `save_stats` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveStatsRequest {
    #[serde(flatten)]
    pub attempt: AttemptContext,
    pub stats: SyncStats,
    pub stream_stats: Vec<StreamSyncStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_stats_default_is_zeroed_and_unknown() {
        let stats = SyncStats::default();
        assert_eq!(stats.records_emitted, 0);
        assert_eq!(stats.bytes_emitted, 0);
        assert!(stats.records_committed.is_none());
        assert_eq!(stats.records_rejected, 0);
        assert!(stats.estimated_records.is_none());
    }

    #[test]
    fn unknown_committed_is_omitted() {
        let json = serde_json::to_value(SyncStats {
            records_emitted: 3,
            ..SyncStats::default()
        })
        .unwrap();
        assert!(json.get("records_committed").is_none());
        assert_eq!(json["records_emitted"], 3);
    }

    #[test]
    fn rejected_defaults_to_zero_when_absent() {
        let stats: SyncStats =
            serde_json::from_str(r#"{"records_emitted": 4, "bytes_emitted": 40}"#).unwrap();
        assert_eq!(stats.records_rejected, 0);
    }

    #[test]
    fn save_stats_request_flattens_attempt() {
        let req = SaveStatsRequest {
            attempt: AttemptContext::new(7, 2),
            stats: SyncStats::default(),
            stream_stats: vec![],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["job_id"], 7);
        assert_eq!(json["attempt_number"], 2);
    }
}
