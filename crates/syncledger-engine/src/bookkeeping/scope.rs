//! Per-scope checkpoint queue and timing accumulators.

use std::collections::VecDeque;
use std::time::Instant;

use syncledger_types::state::StateMessage;
use syncledger_types::stream::StreamKey;

/// Record and byte counts of one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counts {
    pub records: u64,
    pub bytes: u64,
}

/// A source checkpoint waiting for its destination acknowledgment.
#[derive(Debug)]
struct StagedCheckpoint {
    state: StateMessage,
    /// Emitted counts of every covered stream when the checkpoint arrived.
    snapshots: Vec<(StreamKey, Counts)>,
    /// Records emitted since the previous checkpoint of the scope.
    records_since_previous: u64,
    received_at: Instant,
}

/// Running max/mean over whole-second durations.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TimingSummary {
    count: u64,
    total_secs: u64,
    max_secs: u64,
}

impl TimingSummary {
    fn record(&mut self, secs: u64) {
        self.count += 1;
        self.total_secs = self.total_secs.saturating_add(secs);
        self.max_secs = self.max_secs.max(secs);
    }

    pub fn merge(&mut self, other: &Self) {
        self.count += other.count;
        self.total_secs = self.total_secs.saturating_add(other.total_secs);
        self.max_secs = self.max_secs.max(other.max_secs);
    }

    pub fn max(&self) -> Option<u64> {
        (self.count > 0).then_some(self.max_secs)
    }

    pub fn mean(&self) -> Option<u64> {
        (self.count > 0).then(|| self.total_secs / self.count)
    }
}

pub(crate) enum SourceOutcome {
    Staged,
    /// Content-equal to a checkpoint still pending in this scope.
    Collision,
    /// Scope stopped tracking after an earlier collision.
    Untracked,
}

pub(crate) enum AckOutcome {
    Committed {
        /// Snapshots of every consumed checkpoint, oldest first.
        snapshots: Vec<(StreamKey, Counts)>,
        /// Records the matched checkpoint covered on its own.
        matched_records: u64,
    },
    NotFound,
    Untracked,
}

/// FIFO of pending source checkpoints for one scope: a single stream, or
/// the whole sync for GLOBAL and LEGACY checkpoints.
#[derive(Debug, Default)]
pub(crate) struct ScopeCheckpoints {
    pending: VecDeque<StagedCheckpoint>,
    unreliable: bool,
    last_source_at: Option<Instant>,
    pub source_gaps: TimingSummary,
    pub emit_to_commit: TimingSummary,
}

impl ScopeCheckpoints {
    pub fn record_source(
        &mut self,
        state: &StateMessage,
        snapshots: Vec<(StreamKey, Counts)>,
        records_since_previous: u64,
        now: Instant,
    ) -> SourceOutcome {
        if let Some(previous) = self.last_source_at {
            self.source_gaps
                .record(now.saturating_duration_since(previous).as_secs());
        }
        self.last_source_at = Some(now);

        if self.unreliable {
            return SourceOutcome::Untracked;
        }
        if self.pending.iter().any(|c| c.state.same_checkpoint(state)) {
            self.pending.clear();
            self.unreliable = true;
            return SourceOutcome::Collision;
        }
        self.pending.push_back(StagedCheckpoint {
            state: state.clone(),
            snapshots,
            records_since_previous,
            received_at: now,
        });
        SourceOutcome::Staged
    }

    /// Consume every pending checkpoint up to and including the one equal
    /// to `state`.
    pub fn record_ack(&mut self, state: &StateMessage, now: Instant) -> AckOutcome {
        if self.unreliable {
            return AckOutcome::Untracked;
        }
        let Some(idx) = self.pending.iter().position(|c| c.state.same_checkpoint(state)) else {
            return AckOutcome::NotFound;
        };

        let mut snapshots = Vec::new();
        let mut matched_at = now;
        let mut matched_records = 0;
        for staged in self.pending.drain(..=idx) {
            matched_at = staged.received_at;
            matched_records = staged.records_since_previous;
            snapshots.extend(staged.snapshots);
        }
        self.emit_to_commit
            .record(now.saturating_duration_since(matched_at).as_secs());
        AckOutcome::Committed {
            snapshots,
            matched_records,
        }
    }

    #[cfg(test)]
    pub fn is_unreliable(&self) -> bool {
        self.unreliable
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn cp(cursor: i64) -> StateMessage {
        StateMessage::stream(StreamKey::new("s"), json!({ "cursor": cursor }))
    }

    fn snap(records: u64) -> Vec<(StreamKey, Counts)> {
        vec![(
            StreamKey::new("s"),
            Counts {
                records,
                bytes: records * 10,
            },
        )]
    }

    fn committed_records(outcome: AckOutcome) -> Vec<u64> {
        match outcome {
            AckOutcome::Committed { snapshots, .. } => {
                snapshots.into_iter().map(|(_, c)| c.records).collect()
            }
            AckOutcome::NotFound => panic!("expected commit, got not found"),
            AckOutcome::Untracked => panic!("expected commit, got untracked"),
        }
    }

    #[test]
    fn ack_consumes_up_to_match() {
        let now = Instant::now();
        let mut scope = ScopeCheckpoints::default();
        for i in 1..=3 {
            scope.record_source(&cp(i), snap(u64::try_from(i).unwrap()), 1, now);
        }

        assert_eq!(committed_records(scope.record_ack(&cp(2), now)), vec![1, 2]);
        assert_eq!(scope.pending_len(), 1);
        assert!(matches!(scope.record_ack(&cp(1), now), AckOutcome::NotFound));
        assert!(matches!(scope.record_ack(&cp(2), now), AckOutcome::NotFound));
        assert_eq!(committed_records(scope.record_ack(&cp(3), now)), vec![3]);
        assert_eq!(scope.pending_len(), 0);
    }

    #[test]
    fn ack_reports_records_of_matched_checkpoint_only() {
        let now = Instant::now();
        let mut scope = ScopeCheckpoints::default();
        scope.record_source(&cp(1), snap(4), 4, now);
        scope.record_source(&cp(2), snap(7), 3, now);
        match scope.record_ack(&cp(2), now) {
            AckOutcome::Committed {
                snapshots,
                matched_records,
            } => {
                assert_eq!(snapshots.len(), 2);
                assert_eq!(matched_records, 3);
            }
            _ => panic!("expected commit"),
        }
    }

    #[test]
    fn duplicate_pending_checkpoint_collides_once() {
        let now = Instant::now();
        let mut scope = ScopeCheckpoints::default();
        assert!(matches!(
            scope.record_source(&cp(1), snap(1), 1, now),
            SourceOutcome::Staged
        ));
        assert!(matches!(
            scope.record_source(&cp(1), snap(1), 1, now),
            SourceOutcome::Collision
        ));
        assert!(scope.is_unreliable());
        assert_eq!(scope.pending_len(), 0);
        assert!(matches!(
            scope.record_source(&cp(1), snap(1), 1, now),
            SourceOutcome::Untracked
        ));
        assert!(matches!(scope.record_ack(&cp(1), now), AckOutcome::Untracked));
    }

    #[test]
    fn same_content_after_commit_is_not_a_collision() {
        let now = Instant::now();
        let mut scope = ScopeCheckpoints::default();
        scope.record_source(&cp(1), snap(1), 1, now);
        scope.record_ack(&cp(1), now);
        assert!(matches!(
            scope.record_source(&cp(1), snap(2), 1, now),
            SourceOutcome::Staged
        ));
    }

    #[test]
    fn timings_use_arrival_instants() {
        let start = Instant::now();
        let mut scope = ScopeCheckpoints::default();
        scope.record_source(&cp(1), snap(1), 1, start);
        scope.record_source(&cp(2), snap(2), 1, start + Duration::from_secs(4));
        scope.record_source(&cp(3), snap(3), 1, start + Duration::from_secs(6));
        assert_eq!(scope.source_gaps.max(), Some(4));
        assert_eq!(scope.source_gaps.mean(), Some(3));

        scope.record_ack(&cp(2), start + Duration::from_secs(10));
        assert_eq!(scope.emit_to_commit.max(), Some(6));
    }

    #[test]
    fn timing_summary_merge_weights_by_count() {
        let mut a = TimingSummary::default();
        a.record(2);
        a.record(4);
        let mut b = TimingSummary::default();
        b.record(9);
        a.merge(&b);
        assert_eq!(a.max(), Some(9));
        assert_eq!(a.mean(), Some(5));
        assert_eq!(TimingSummary::default().mean(), None);
    }
}
