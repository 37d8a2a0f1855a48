//! In-memory emitted/committed/estimated accounting for one attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};

use syncledger_types::message::{EstimateMessage, RecordMessage};
use syncledger_types::state::StateMessage;
use syncledger_types::stats::{StreamSyncStats, SyncStats};
use syncledger_types::stream::StreamKey;

use super::checksum::{self, ChecksumMismatch, CheckpointOrigin};
use super::scope::{AckOutcome, Counts, ScopeCheckpoints, SourceOutcome, TimingSummary};
use crate::clock::Clock;
use crate::metrics::{Metric, MetricClient};

/// Whether a run checkpoints per stream or for the whole sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointScope {
    Stream,
    Global,
}

impl CheckpointScope {
    fn of(state: &StateMessage) -> Self {
        match state {
            StateMessage::Stream { .. } => Self::Stream,
            StateMessage::Global { .. } | StateMessage::Legacy { .. } => Self::Global,
        }
    }
}

#[derive(Debug, Default)]
struct StreamEntry {
    emitted: Counts,
    /// Emitted counts of the latest acknowledged checkpoint.
    committed: Counts,
    /// Records the destination reported as rejected; excluded from
    /// committed.
    rejected: u64,
    emitted_at_last_checkpoint: u64,
    checkpoints: ScopeCheckpoints,
}

impl StreamEntry {
    /// Records emitted since the previous source checkpoint covering this
    /// stream. Resets the mark.
    fn take_records_since_checkpoint(&mut self) -> u64 {
        let since = self
            .emitted
            .records
            .saturating_sub(self.emitted_at_last_checkpoint);
        self.emitted_at_last_checkpoint = self.emitted.records;
        since
    }

    fn committed_records(&self, has_replication_completed: bool) -> u64 {
        let base = if has_replication_completed {
            self.emitted.records
        } else {
            self.committed.records
        };
        base.saturating_sub(self.rejected)
    }
}

#[derive(Debug, Default)]
enum EstimateState {
    #[default]
    Unset,
    Streams(HashMap<StreamKey, Counts>),
    Sync(Counts),
    /// Both scopes were observed; no estimates for the rest of the run.
    Disabled,
}

// Poisoned tracker locks are recovered: recording never fails.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reconciles emitted against committed records for one replication
/// attempt.
///
/// Source checkpoints are queued per scope together with the emitted counts
/// at the time they were raised. A matching destination acknowledgment
/// commits those counts. Anomalous input (duplicate checkpoints, unknown
/// acknowledgments, mixed estimate scopes) is counted and absorbed; no
/// method blocks on I/O or fails.
///
/// Record counts attached to STREAM and GLOBAL checkpoints are compared
/// with the records seen since the previous checkpoint. Mismatches are
/// counted and returned to the caller; validation stops after the first
/// checkpoint collision.
///
/// Lock order: global queue or estimates, then the stream map, then a
/// single stream entry.
pub struct StreamStatsTracker {
    streams: RwLock<HashMap<StreamKey, Arc<Mutex<StreamEntry>>>>,
    global: Mutex<ScopeCheckpoints>,
    estimates: Mutex<EstimateState>,
    run_scope: OnceLock<CheckpointScope>,
    source_checkpoints: AtomicU64,
    destination_checkpoints: AtomicU64,
    checkpoint_recorded: AtomicBool,
    anomaly_seen: AtomicBool,
    checksum_enabled: AtomicBool,
    metrics: Arc<dyn MetricClient>,
    clock: Arc<dyn Clock>,
}

impl StreamStatsTracker {
    #[must_use]
    pub fn new(metrics: Arc<dyn MetricClient>, clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            global: Mutex::new(ScopeCheckpoints::default()),
            estimates: Mutex::new(EstimateState::Unset),
            run_scope: OnceLock::new(),
            source_checkpoints: AtomicU64::new(0),
            destination_checkpoints: AtomicU64::new(0),
            checkpoint_recorded: AtomicBool::new(false),
            anomaly_seen: AtomicBool::new(false),
            checksum_enabled: AtomicBool::new(true),
            metrics,
            clock,
        }
    }

    // ── Stream map ──────────────────────────────────────────────────

    fn entry(&self, stream: &StreamKey) -> Arc<Mutex<StreamEntry>> {
        if let Some(entry) = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
        {
            return Arc::clone(entry);
        }
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(streams.entry(stream.clone()).or_default())
    }

    fn existing_entry(&self, stream: &StreamKey) -> Option<Arc<Mutex<StreamEntry>>> {
        self.streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream)
            .map(Arc::clone)
    }

    /// Every stream entry, ordered by key.
    fn sorted_entries(&self) -> Vec<(StreamKey, Arc<Mutex<StreamEntry>>)> {
        let mut entries: Vec<_> = self
            .streams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    // ── Records ─────────────────────────────────────────────────────

    /// Count one emitted record of `size_bytes` for `stream`.
    pub fn record_emitted_message(&self, stream: &StreamKey, size_bytes: u64) {
        let entry = self.entry(stream);
        let mut entry = lock(&entry);
        entry.emitted.records += 1;
        entry.emitted.bytes = entry.emitted.bytes.saturating_add(size_bytes);
    }

    /// Count a record emitted by the source.
    pub fn update_stats(&self, record: &RecordMessage) {
        self.record_emitted_message(&record.stream, record.size_bytes());
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    /// Stage a checkpoint raised by the source.
    ///
    /// Returns the mismatch when the source attached a record count that
    /// differs from the records seen since its previous checkpoint.
    pub fn record_source_checkpoint(&self, state: &StateMessage) -> Option<ChecksumMismatch> {
        self.source_checkpoints.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_recorded.store(true, Ordering::Release);

        let scope = CheckpointScope::of(state);
        let run_scope = *self.run_scope.get_or_init(|| scope);
        if scope != run_scope {
            tracing::warn!(
                state_type = %state.state_type(),
                "Ignoring source checkpoint of a different scope than the rest of the sync"
            );
            return None;
        }

        let now = self.clock.now();
        let (outcome, records_since_previous) = match state {
            StateMessage::Stream { descriptor, .. } => {
                let entry = self.entry(descriptor);
                let mut entry = lock(&entry);
                let since = entry.take_records_since_checkpoint();
                let snapshot = vec![(descriptor.clone(), entry.emitted)];
                (entry.checkpoints.record_source(state, snapshot, since, now), since)
            }
            StateMessage::Global { .. } | StateMessage::Legacy { .. } => {
                let mut global = lock(&self.global);
                let covered: Vec<StreamKey> = match state {
                    StateMessage::Global { .. } => state.streams().into_iter().cloned().collect(),
                    _ => self.sorted_entries().into_iter().map(|(k, _)| k).collect(),
                };
                let mut since = 0u64;
                let mut snapshots = Vec::with_capacity(covered.len());
                for key in covered {
                    let entry = self.entry(&key);
                    let mut entry = lock(&entry);
                    since = since.saturating_add(entry.take_records_since_checkpoint());
                    snapshots.push((key, entry.emitted));
                }
                (global.record_source(state, snapshots, since, now), since)
            }
        };

        match outcome {
            SourceOutcome::Staged => {}
            SourceOutcome::Untracked => self.disable_checksum_validation(),
            SourceOutcome::Collision => {
                self.anomaly_seen.store(true, Ordering::Release);
                self.metrics
                    .count(Metric::StateErrorCollisionFromSource, 1, &[]);
                tracing::warn!(
                    state_type = %state.state_type(),
                    streams = ?state.streams(),
                    "Source emitted a checkpoint identical to one still pending; \
                     committed counts stop advancing until the sync completes"
                );
                self.disable_checksum_validation();
            }
        }

        self.validate_checksum(CheckpointOrigin::Source, state, records_since_previous)
    }

    /// Commit the counts covered by a checkpoint the destination
    /// acknowledged.
    ///
    /// Records the destination reports as rejected on a matched STREAM
    /// checkpoint are moved from committed to rejected. Returns the
    /// mismatch when the attached record counts disagree with the records
    /// the matched checkpoint covered.
    pub fn record_destination_checkpoint(&self, state: &StateMessage) -> Option<ChecksumMismatch> {
        self.destination_checkpoints.fetch_add(1, Ordering::Relaxed);

        let scope = CheckpointScope::of(state);
        let now = self.clock.now();
        let outcome = if self.run_scope.get() == Some(&scope) {
            match state {
                StateMessage::Stream { descriptor, .. } => match self.existing_entry(descriptor) {
                    Some(entry) => {
                        let mut entry = lock(&entry);
                        let outcome = entry.checkpoints.record_ack(state, now);
                        if let AckOutcome::Committed { snapshots, .. } = &outcome {
                            for (_, counts) in snapshots {
                                entry.committed = *counts;
                            }
                            let rejected = state
                                .destination_stats()
                                .and_then(|s| s.rejected_record_count)
                                .unwrap_or(0);
                            entry.rejected = entry.rejected.saturating_add(rejected);
                        }
                        outcome
                    }
                    None => AckOutcome::NotFound,
                },
                StateMessage::Global { .. } | StateMessage::Legacy { .. } => {
                    let mut global = lock(&self.global);
                    let outcome = global.record_ack(state, now);
                    if let AckOutcome::Committed { snapshots, .. } = &outcome {
                        for (key, counts) in snapshots {
                            lock(&self.entry(key)).committed = *counts;
                        }
                    }
                    outcome
                }
            }
        } else {
            AckOutcome::NotFound
        };

        match outcome {
            AckOutcome::Committed {
                matched_records, ..
            } => self.validate_checksum(CheckpointOrigin::Destination, state, matched_records),
            AckOutcome::Untracked => None,
            AckOutcome::NotFound => {
                self.anomaly_seen.store(true, Ordering::Release);
                self.metrics
                    .count(Metric::StateErrorUnknownFromDestination, 1, &[]);
                tracing::warn!(
                    state_type = %state.state_type(),
                    streams = ?state.streams(),
                    "Destination acknowledged a checkpoint that is not pending"
                );
                None
            }
        }
    }

    fn disable_checksum_validation(&self) {
        if self.checksum_enabled.swap(false, Ordering::AcqRel) {
            tracing::warn!("State checksum validation disabled: source checkpoint collision detected");
        }
    }

    fn validate_checksum(
        &self,
        origin: CheckpointOrigin,
        state: &StateMessage,
        platform_count: u64,
    ) -> Option<ChecksumMismatch> {
        let mismatch = checksum::validate(origin, state, platform_count).err()?;
        if !self.checksum_enabled.load(Ordering::Acquire) {
            tracing::warn!(
                %mismatch,
                "Ignoring state checksum mismatch, checkpoint collisions make the comparison unreliable"
            );
            return None;
        }
        self.metrics
            .count(Metric::StateChecksumCountError, 1, &[("origin", origin.as_str())]);
        tracing::error!(
            origin = %origin,
            state_type = %state.state_type(),
            %mismatch,
            "State checksum mismatch, the sync may have dropped records"
        );
        Some(mismatch)
    }

    /// Whether checkpoint record counts are still being validated.
    #[must_use]
    pub fn checksum_validation_enabled(&self) -> bool {
        self.checksum_enabled.load(Ordering::Acquire)
    }

    // ── Estimates ───────────────────────────────────────────────────

    /// Replace the current estimate for the estimate's scope.
    pub fn update_estimates(&self, estimate: &EstimateMessage) {
        let mut estimates = lock(&self.estimates);
        let next = match (std::mem::take(&mut *estimates), estimate) {
            (EstimateState::Disabled, _) => EstimateState::Disabled,
            (
                EstimateState::Unset,
                EstimateMessage::Stream {
                    stream,
                    row_estimate,
                    byte_estimate,
                },
            ) => {
                self.entry(stream);
                EstimateState::Streams(HashMap::from([(
                    stream.clone(),
                    Counts {
                        records: *row_estimate,
                        bytes: *byte_estimate,
                    },
                )]))
            }
            (
                EstimateState::Streams(mut per_stream),
                EstimateMessage::Stream {
                    stream,
                    row_estimate,
                    byte_estimate,
                },
            ) => {
                self.entry(stream);
                per_stream.insert(
                    stream.clone(),
                    Counts {
                        records: *row_estimate,
                        bytes: *byte_estimate,
                    },
                );
                EstimateState::Streams(per_stream)
            }
            (
                EstimateState::Unset | EstimateState::Sync(_),
                EstimateMessage::Sync {
                    row_estimate,
                    byte_estimate,
                },
            ) => EstimateState::Sync(Counts {
                records: *row_estimate,
                bytes: *byte_estimate,
            }),
            (EstimateState::Streams(_), EstimateMessage::Sync { .. })
            | (EstimateState::Sync(_), EstimateMessage::Stream { .. }) => {
                tracing::info!("STREAM and SYNC estimates should not be emitted in the same sync");
                EstimateState::Disabled
            }
        };
        *estimates = next;
    }

    fn stream_estimates(&self) -> HashMap<StreamKey, Counts> {
        match &*lock(&self.estimates) {
            EstimateState::Streams(per_stream) => per_stream.clone(),
            _ => HashMap::new(),
        }
    }

    // ── Aggregated stats ────────────────────────────────────────────

    fn committed_known(&self, has_replication_completed: bool) -> bool {
        has_replication_completed || self.checkpoint_recorded.load(Ordering::Acquire)
    }

    /// Per-stream stats, ordered by stream.
    ///
    /// With `has_replication_completed`, every stream's committed counts
    /// are reconciled to its emitted counts.
    #[must_use]
    pub fn get_all_stream_sync_stats(&self, has_replication_completed: bool) -> Vec<StreamSyncStats> {
        let estimates = self.stream_estimates();
        let committed_known = self.committed_known(has_replication_completed);

        self.sorted_entries()
            .into_iter()
            .map(|(stream, entry)| {
                let entry = lock(&entry);
                let committed_bytes = if has_replication_completed {
                    entry.emitted.bytes
                } else {
                    entry.committed.bytes
                };
                let estimated = estimates.get(&stream);
                StreamSyncStats {
                    stats: SyncStats {
                        records_emitted: entry.emitted.records,
                        bytes_emitted: entry.emitted.bytes,
                        records_committed: committed_known
                            .then(|| entry.committed_records(has_replication_completed)),
                        bytes_committed: committed_known.then_some(committed_bytes),
                        records_rejected: entry.rejected,
                        estimated_records: estimated.map(|e| e.records),
                        estimated_bytes: estimated.map(|e| e.bytes),
                    },
                    stream,
                }
            })
            .collect()
    }

    /// Sync-wide totals, reconciled like
    /// [`get_all_stream_sync_stats`](Self::get_all_stream_sync_stats).
    #[must_use]
    pub fn get_total_stats(&self, has_replication_completed: bool) -> SyncStats {
        let rows = self.get_all_stream_sync_stats(has_replication_completed);
        let committed_known = self.committed_known(has_replication_completed);
        let sum = |f: fn(&SyncStats) -> u64| rows.iter().map(|r| f(&r.stats)).sum::<u64>();

        let estimated = match &*lock(&self.estimates) {
            EstimateState::Sync(counts) => Some(*counts),
            EstimateState::Streams(per_stream) => Some(Counts {
                records: per_stream.values().map(|c| c.records).sum(),
                bytes: per_stream.values().map(|c| c.bytes).sum(),
            }),
            EstimateState::Unset | EstimateState::Disabled => None,
        };

        SyncStats {
            records_emitted: sum(|s| s.records_emitted),
            bytes_emitted: sum(|s| s.bytes_emitted),
            records_committed: committed_known
                .then(|| sum(|s| s.records_committed.unwrap_or(0))),
            bytes_committed: committed_known.then(|| sum(|s| s.bytes_committed.unwrap_or(0))),
            records_rejected: sum(|s| s.records_rejected),
            estimated_records: estimated.map(|c| c.records),
            estimated_bytes: estimated.map(|c| c.bytes),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    fn per_stream(&self, read: impl Fn(&StreamEntry) -> u64) -> HashMap<StreamKey, u64> {
        self.sorted_entries()
            .into_iter()
            .map(|(key, entry)| {
                let value = read(&*lock(&entry));
                (key, value)
            })
            .collect()
    }

    #[must_use]
    pub fn stream_to_emitted_records(&self) -> HashMap<StreamKey, u64> {
        self.per_stream(|e| e.emitted.records)
    }

    #[must_use]
    pub fn stream_to_emitted_bytes(&self) -> HashMap<StreamKey, u64> {
        self.per_stream(|e| e.emitted.bytes)
    }

    /// `None` until a checkpoint has been recorded.
    #[must_use]
    pub fn stream_to_committed_records(&self) -> Option<HashMap<StreamKey, u64>> {
        self.committed_known(false)
            .then(|| self.per_stream(|e| e.committed_records(false)))
    }

    #[must_use]
    pub fn stream_to_rejected_records(&self) -> HashMap<StreamKey, u64> {
        self.per_stream(|e| e.rejected)
    }

    /// `None` until a checkpoint has been recorded.
    #[must_use]
    pub fn stream_to_committed_bytes(&self) -> Option<HashMap<StreamKey, u64>> {
        self.committed_known(false)
            .then(|| self.per_stream(|e| e.committed.bytes))
    }

    /// Empty unless per-stream estimates are being tracked.
    #[must_use]
    pub fn stream_to_estimated_records(&self) -> HashMap<StreamKey, u64> {
        self.stream_estimates()
            .into_iter()
            .map(|(k, c)| (k, c.records))
            .collect()
    }

    /// Empty unless per-stream estimates are being tracked.
    #[must_use]
    pub fn stream_to_estimated_bytes(&self) -> HashMap<StreamKey, u64> {
        self.stream_estimates()
            .into_iter()
            .map(|(k, c)| (k, c.bytes))
            .collect()
    }

    #[must_use]
    pub fn total_records_emitted(&self) -> u64 {
        self.get_total_stats(false).records_emitted
    }

    #[must_use]
    pub fn total_bytes_emitted(&self) -> u64 {
        self.get_total_stats(false).bytes_emitted
    }

    #[must_use]
    pub fn total_records_committed(&self) -> Option<u64> {
        self.get_total_stats(false).records_committed
    }

    #[must_use]
    pub fn total_bytes_committed(&self) -> Option<u64> {
        self.get_total_stats(false).bytes_committed
    }

    #[must_use]
    pub fn total_records_rejected(&self) -> u64 {
        self.get_total_stats(false).records_rejected
    }

    #[must_use]
    pub fn total_records_estimated(&self) -> Option<u64> {
        self.get_total_stats(false).estimated_records
    }

    #[must_use]
    pub fn total_bytes_estimated(&self) -> Option<u64> {
        self.get_total_stats(false).estimated_bytes
    }

    /// Raw count of source checkpoint messages, tracked or not.
    #[must_use]
    pub fn total_source_state_messages(&self) -> u64 {
        self.source_checkpoints.load(Ordering::Relaxed)
    }

    /// Raw count of destination checkpoint messages, matched or not.
    #[must_use]
    pub fn total_destination_state_messages(&self) -> u64 {
        self.destination_checkpoints.load(Ordering::Relaxed)
    }

    // ── Timing ──────────────────────────────────────────────────────

    fn merged_timings(&self) -> (TimingSummary, TimingSummary) {
        let mut source_gaps = TimingSummary::default();
        let mut emit_to_commit = TimingSummary::default();
        {
            let global = lock(&self.global);
            source_gaps.merge(&global.source_gaps);
            emit_to_commit.merge(&global.emit_to_commit);
        }
        for (_, entry) in self.sorted_entries() {
            let entry = lock(&entry);
            source_gaps.merge(&entry.checkpoints.source_gaps);
            emit_to_commit.merge(&entry.checkpoints.emit_to_commit);
        }
        (source_gaps, emit_to_commit)
    }

    /// Longest gap, in seconds, between consecutive source checkpoints of a
    /// scope. Zero with fewer than two checkpoints.
    #[must_use]
    pub fn max_seconds_between_source_checkpoints(&self) -> u64 {
        self.merged_timings().0.max().unwrap_or(0)
    }

    /// Mean gap, in seconds, between consecutive source checkpoints of a
    /// scope. Zero with fewer than two checkpoints.
    #[must_use]
    pub fn mean_seconds_between_source_checkpoints(&self) -> u64 {
        self.merged_timings().0.mean().unwrap_or(0)
    }

    /// Longest delay, in seconds, between a source checkpoint and its
    /// matching acknowledgment. `None` when nothing matched or timings are
    /// unreliable.
    #[must_use]
    pub fn max_seconds_emitted_to_committed(&self) -> Option<u64> {
        if self.unreliable_state_timing_metrics() {
            return None;
        }
        self.merged_timings().1.max()
    }

    /// Mean delay, in seconds, between a source checkpoint and its matching
    /// acknowledgment. `None` when nothing matched or timings are
    /// unreliable.
    #[must_use]
    pub fn mean_seconds_emitted_to_committed(&self) -> Option<u64> {
        if self.unreliable_state_timing_metrics() {
            return None;
        }
        self.merged_timings().1.mean()
    }

    /// True once any checkpoint anomaly has been observed in this run.
    #[must_use]
    pub fn unreliable_state_timing_metrics(&self) -> bool {
        self.anomaly_seen.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for StreamStatsTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStatsTracker")
            .field("source_checkpoints", &self.total_source_state_messages())
            .field("destination_checkpoints", &self.total_destination_state_messages())
            .field("unreliable", &self.unreliable_state_timing_metrics())
            .finish_non_exhaustive()
    }
}
