//! Property tests for emitted versus committed accounting.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use syncledger_engine::clock::SystemClock;
use syncledger_engine::metrics::NoopMetricClient;
use syncledger_engine::StreamStatsTracker;
use syncledger_types::state::StateMessage;
use syncledger_types::stream::StreamKey;

#[derive(Debug, Clone)]
enum Op {
    Emit { stream: usize, bytes: u64 },
    Checkpoint { stream: usize, cursor: u8 },
    Ack { stream: usize, cursor: u8 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..3usize, 0..512u64).prop_map(|(stream, bytes)| Op::Emit { stream, bytes }),
        1 => (0..3usize, 0..6u8).prop_map(|(stream, cursor)| Op::Checkpoint { stream, cursor }),
        1 => (0..3usize, 0..6u8).prop_map(|(stream, cursor)| Op::Ack { stream, cursor }),
    ]
}

fn key(stream: usize) -> StreamKey {
    StreamKey::new(format!("stream_{stream}"))
}

fn checkpoint(stream: usize, cursor: u8) -> StateMessage {
    StateMessage::stream(key(stream), json!({ "cursor": cursor }))
}

fn tracker() -> StreamStatsTracker {
    StreamStatsTracker::new(Arc::new(NoopMetricClient), Arc::new(SystemClock))
}

proptest! {
    #[test]
    fn emitted_totals_match_input(ops in prop::collection::vec(op(), 0..200)) {
        let tracker = tracker();
        let mut records = 0u64;
        let mut bytes = 0u64;
        for op in &ops {
            match *op {
                Op::Emit { stream, bytes: size } => {
                    tracker.record_emitted_message(&key(stream), size);
                    records += 1;
                    bytes += size;
                }
                Op::Checkpoint { stream, cursor } => {
                    tracker.record_source_checkpoint(&checkpoint(stream, cursor));
                }
                Op::Ack { stream, cursor } => {
                    tracker.record_destination_checkpoint(&checkpoint(stream, cursor));
                }
            }
        }

        let total = tracker.get_total_stats(false);
        prop_assert_eq!(total.records_emitted, records);
        prop_assert_eq!(total.bytes_emitted, bytes);
        let per_stream: u64 = tracker.stream_to_emitted_records().values().sum();
        prop_assert_eq!(per_stream, records);
    }

    #[test]
    fn committed_never_exceeds_emitted(ops in prop::collection::vec(op(), 0..200)) {
        let tracker = tracker();
        for op in &ops {
            match *op {
                Op::Emit { stream, bytes } => tracker.record_emitted_message(&key(stream), bytes),
                Op::Checkpoint { stream, cursor } => {
                    tracker.record_source_checkpoint(&checkpoint(stream, cursor));
                }
                Op::Ack { stream, cursor } => {
                    tracker.record_destination_checkpoint(&checkpoint(stream, cursor));
                }
            }

            for row in tracker.get_all_stream_sync_stats(false) {
                let committed = row.stats.records_committed.unwrap_or(0);
                prop_assert!(committed <= row.stats.records_emitted);
                let committed_bytes = row.stats.bytes_committed.unwrap_or(0);
                prop_assert!(committed_bytes <= row.stats.bytes_emitted);
            }
        }
    }

    #[test]
    fn completion_reconciles_committed_to_emitted(ops in prop::collection::vec(op(), 0..200)) {
        let tracker = tracker();
        for op in &ops {
            match *op {
                Op::Emit { stream, bytes } => tracker.record_emitted_message(&key(stream), bytes),
                Op::Checkpoint { stream, cursor } => {
                    tracker.record_source_checkpoint(&checkpoint(stream, cursor));
                }
                Op::Ack { stream, cursor } => {
                    tracker.record_destination_checkpoint(&checkpoint(stream, cursor));
                }
            }
        }

        let total = tracker.get_total_stats(true);
        prop_assert_eq!(total.records_committed, Some(total.records_emitted));
        prop_assert_eq!(total.bytes_committed, Some(total.bytes_emitted));
        for row in tracker.get_all_stream_sync_stats(true) {
            prop_assert_eq!(row.stats.records_committed, Some(row.stats.records_emitted));
        }
    }
}
