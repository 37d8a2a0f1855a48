//! Buffered checkpoint flusher.
//!
//! [`SyncPersistence`] accepts destination-acknowledged checkpoints, folds
//! them through a [`StateAggregator`] and writes the result, together with
//! the tracker's stats, on a fixed period. `close()` stops the timer and
//! performs one final, retried flush.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use syncledger_state::api::{AttemptApi, StateApi};
use syncledger_types::catalog::ConfiguredCatalog;
use syncledger_types::message::{EstimateMessage, RecordMessage};
use syncledger_types::state::{StateMessage, StateType, StateWrapper};
use syncledger_types::stats::{SaveStatsRequest, StreamSyncStats, SyncStats};
use syncledger_types::stream::{AttemptContext, ConnectionId};
use tokio::sync::{watch, Mutex as AsyncMutex, OnceCell};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

use crate::aggregator::{DefaultStateAggregatorFactory, StateAggregator, StateAggregatorFactory};
use crate::bookkeeping::{ChecksumMismatch, StreamStatsTracker};
use crate::clock::{Clock, SystemClock};
use crate::errors::{PersistenceError, Result};
use crate::metrics::{Metric, MetricClient};
use crate::migration::{is_stream_migration, validate_stream_migration};
use crate::retry::{retry_blocking, RetryPolicy};

const DEFAULT_FLUSH_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_FLUSH_PERIOD: Duration = Duration::from_millis(1);

/// Runtime settings of a [`SyncPersistence`].
#[derive(Debug, Clone, Copy)]
pub struct SyncPersistenceConfig {
    /// Interval between scheduled flushes.
    pub flush_period: Duration,
    /// Delay before the first scheduled flush once the timer starts.
    pub flush_initial_delay: Duration,
    /// How long `close()` waits for an in-flight flush.
    pub flush_termination_timeout: Duration,
    /// Retry policy of the final flush.
    pub retry: RetryPolicy,
    /// Surface checkpoint record count mismatches as
    /// [`PersistenceError::InvalidChecksum`] instead of only counting them.
    pub fail_on_invalid_checksum: bool,
}

impl Default for SyncPersistenceConfig {
    fn default() -> Self {
        Self {
            flush_period: DEFAULT_FLUSH_PERIOD,
            flush_initial_delay: Duration::ZERO,
            flush_termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            retry: RetryPolicy::default(),
            fail_on_invalid_checksum: false,
        }
    }
}

/// Collaborators of a [`SyncPersistence`].
pub struct SyncPersistenceDeps {
    state_api: Arc<dyn StateApi>,
    attempt_api: Arc<dyn AttemptApi>,
    metrics: Arc<dyn MetricClient>,
    clock: Arc<dyn Clock>,
    aggregator_factory: Arc<dyn StateAggregatorFactory>,
}

impl SyncPersistenceDeps {
    /// Dependencies with the system clock and the default aggregator.
    #[must_use]
    pub fn new(
        state_api: Arc<dyn StateApi>,
        attempt_api: Arc<dyn AttemptApi>,
        metrics: Arc<dyn MetricClient>,
    ) -> Self {
        Self {
            state_api,
            attempt_api,
            metrics,
            clock: Arc::new(SystemClock),
            aggregator_factory: Arc::new(DefaultStateAggregatorFactory),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_aggregator_factory(mut self, factory: Arc<dyn StateAggregatorFactory>) -> Self {
        self.aggregator_factory = factory;
        self
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Active,
    Closed,
}

struct FlushTimer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<std::result::Result<(), JoinError>>,
}

struct Lifecycle {
    phase: Phase,
    /// Stored LEGACY state is being replaced by per-stream state; every
    /// write is deferred to `close()`.
    migration_pending: bool,
    timer: Option<FlushTimer>,
}

/// Data taken out of the buffer and not yet written.
#[derive(Default)]
struct FlushSlot {
    state: Option<Box<dyn StateAggregator>>,
    stats: Option<SaveStatsRequest>,
}

struct Inner {
    connection_id: ConnectionId,
    attempt: AttemptContext,
    catalog: ConfiguredCatalog,
    config: SyncPersistenceConfig,
    state_api: Arc<dyn StateApi>,
    attempt_api: Arc<dyn AttemptApi>,
    metrics: Arc<dyn MetricClient>,
    aggregator_factory: Arc<dyn StateAggregatorFactory>,
    tracker: StreamStatsTracker,
    buffer: Mutex<Box<dyn StateAggregator>>,
    /// Held across remote writes; `close()` waits on it with a deadline.
    flush_slot: AsyncMutex<FlushSlot>,
    receiving_stats: AtomicBool,
    stored_state_type: OnceCell<Option<StateType>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    fn count(&self, metric: Metric) {
        self.metrics
            .count(metric, 1, &[("connection_id", self.connection_id.as_str())]);
    }

    fn emit_close_not_attempted(&self) {
        self.count(Metric::StateCommitNotAttempted);
        self.count(Metric::StatsCommitNotAttempted);
    }

    /// Type of the state stored before this attempt, looked up once.
    async fn stored_state_type(&self) -> Option<StateType> {
        *self
            .stored_state_type
            .get_or_init(|| async move {
                let api = Arc::clone(&self.state_api);
                let connection_id = self.connection_id.clone();
                match tokio::task::spawn_blocking(move || api.get_state(&connection_id)).await {
                    Ok(Ok(stored)) => stored.map(|s| s.state_type()),
                    Ok(Err(e)) => {
                        tracing::warn!(
                            connection_id = %self.connection_id,
                            error = %e,
                            "Failed to read stored state, assuming no migration"
                        );
                        None
                    }
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %self.connection_id,
                            error = %e,
                            "Stored state lookup task failed, assuming no migration"
                        );
                        None
                    }
                }
            })
            .await
    }

    fn stats_request(&self, has_replication_completed: bool) -> SaveStatsRequest {
        SaveStatsRequest {
            attempt: self.attempt,
            stats: self.tracker.get_total_stats(has_replication_completed),
            stream_stats: self
                .tracker
                .get_all_stream_sync_stats(has_replication_completed),
        }
    }

    /// Move buffered state into the slot, merging over anything a failed
    /// flush left behind, and snapshot the stats that go with it.
    fn prepare(&self, slot: &mut FlushSlot) -> Result<()> {
        let fresh = {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| PersistenceError::LockPoisoned)?;
            std::mem::replace(&mut *buffer, self.aggregator_factory.create())
        };

        if !fresh.is_empty() {
            match slot.state.as_mut() {
                Some(older) => {
                    for message in fresh.into_messages() {
                        older.ingest(message);
                    }
                }
                None => slot.state = Some(fresh),
            }
        }

        // Stats are only rolled over with state so committed counters never
        // run ahead of persisted checkpoints.
        if slot.state.is_some() && self.receiving_stats.load(Ordering::Acquire) {
            slot.stats = Some(self.stats_request(false));
        }
        Ok(())
    }

    fn write_state(&self, state: &StateWrapper) -> syncledger_state::error::Result<()> {
        self.count(Metric::StateCommitAttempt);
        match self.state_api.create_or_update_state(&self.connection_id, state) {
            Ok(()) => {
                self.count(Metric::StateCommitAttemptSuccessful);
                Ok(())
            }
            Err(e) => {
                self.count(Metric::StateCommitAttemptFailed);
                Err(e)
            }
        }
    }

    fn write_stats(&self, stats: &SaveStatsRequest) -> syncledger_state::error::Result<()> {
        self.count(Metric::StatsCommitAttempt);
        match self.attempt_api.save_stats(stats) {
            Ok(()) => {
                self.count(Metric::StatsCommitAttemptSuccessful);
                Ok(())
            }
            Err(e) => {
                self.count(Metric::StatsCommitAttemptFailed);
                Err(e)
            }
        }
    }

    /// One best-effort flush. Failures stay in the slot for the next one.
    ///
    /// Blocks on the slot; call from the blocking pool.
    fn flush(&self) {
        let mut slot = self.flush_slot.blocking_lock();
        // close() owns whatever is left.
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.prepare(&mut slot) {
            tracing::error!(connection_id = %self.connection_id, error = %e, "Failed to prepare flush");
            return;
        }

        let pending = slot.state.as_ref().map(|agg| agg.aggregated());
        match pending {
            None => {}
            Some(None) => slot.state = None,
            Some(Some(document)) => match self.write_state(&document) {
                Ok(()) => slot.state = None,
                Err(e) => {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        error = %e,
                        "Failed to persist state, will retry on next flush"
                    );
                    return;
                }
            },
        }

        // Also retries stats left over by an earlier failed flush.
        if let Some(stats) = slot.stats.as_ref() {
            match self.write_stats(stats) {
                Ok(()) => slot.stats = None,
                Err(e) => tracing::warn!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "Failed to persist stats, will retry on next flush"
                ),
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.lifecycle
            .lock()
            .map_or(true, |lifecycle| lifecycle.phase == Phase::Closed)
    }

    /// Whether buffered or staged state has not been confirmed written.
    fn has_pending_state(&self) -> bool {
        let buffered = self.buffer.lock().map_or(true, |b| !b.is_empty());
        // A held slot means a write is in flight.
        let staged = self
            .flush_slot
            .try_lock()
            .map_or(true, |slot| slot.state.is_some());
        buffered || staged
    }
}

/// Periodic flush loop. A flush that panics stops the loop and fails the
/// task.
async fn run_flush_timer(
    inner: Arc<Inner>,
    mut shutdown: watch::Receiver<bool>,
) -> std::result::Result<(), JoinError> {
    tokio::select! {
        biased;
        _ = shutdown.changed() => return Ok(()),
        () = tokio::time::sleep(inner.config.flush_initial_delay) => {}
    }

    let mut ticker = tokio::time::interval(inner.config.flush_period.max(MIN_FLUSH_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let task_inner = Arc::clone(&inner);
                if let Err(e) = tokio::task::spawn_blocking(move || task_inner.flush()).await {
                    tracing::error!(
                        connection_id = %inner.connection_id,
                        error = %e,
                        "Scheduled flush task failed, stopping state flush timer"
                    );
                    return Err(e);
                }
            }
        }
    }
    tracing::debug!(connection_id = %inner.connection_id, "State flush timer stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Periodic state and stats flusher for one replication attempt.
///
/// Not `Clone`; share it behind an `Arc`. All methods take `&self` and may
/// be called from concurrent tasks.
pub struct SyncPersistence {
    inner: Arc<Inner>,
}

impl SyncPersistence {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        attempt: AttemptContext,
        catalog: ConfiguredCatalog,
        deps: SyncPersistenceDeps,
        config: SyncPersistenceConfig,
    ) -> Self {
        let tracker = StreamStatsTracker::new(Arc::clone(&deps.metrics), deps.clock);
        let buffer = deps.aggregator_factory.create();
        Self {
            inner: Arc::new(Inner {
                connection_id,
                attempt,
                catalog,
                config,
                state_api: deps.state_api,
                attempt_api: deps.attempt_api,
                metrics: deps.metrics,
                aggregator_factory: deps.aggregator_factory,
                tracker,
                buffer: Mutex::new(buffer),
                flush_slot: AsyncMutex::new(FlushSlot::default()),
                receiving_stats: AtomicBool::new(false),
                stored_state_type: OnceCell::new(),
                lifecycle: Mutex::new(Lifecycle {
                    phase: Phase::Uninitialized,
                    migration_pending: false,
                    timer: None,
                }),
            }),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    /// Buffer a checkpoint acknowledged by the destination.
    ///
    /// The first call looks up the stored state to detect a legacy migration
    /// and, unless one is pending, starts the periodic flush.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidConnection`] for a foreign
    /// connection id and [`PersistenceError::Closed`] after `close()`.
    pub async fn persist(&self, connection_id: &ConnectionId, state: StateMessage) -> Result<()> {
        let inner = &self.inner;
        if *connection_id != inner.connection_id {
            return Err(PersistenceError::InvalidConnection {
                expected: inner.connection_id.clone(),
                got: connection_id.clone(),
            });
        }
        if self.is_closed()? {
            return Err(PersistenceError::Closed);
        }

        let stored = inner.stored_state_type().await;
        let incoming = state.state_type();

        let mut lifecycle = inner
            .lifecycle
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        match lifecycle.phase {
            Phase::Closed => return Err(PersistenceError::Closed),
            Phase::Uninitialized => {
                lifecycle.phase = Phase::Active;
                if is_stream_migration(stored, incoming) {
                    tracing::info!(
                        connection_id = %inner.connection_id,
                        "Legacy to per-stream state migration detected, state will be persisted at the end of the sync"
                    );
                    lifecycle.migration_pending = true;
                }
            }
            Phase::Active => {}
        }
        if lifecycle.migration_pending && incoming == StateType::Global {
            tracing::info!(
                connection_id = %inner.connection_id,
                "Global state received during legacy migration, resuming periodic flush"
            );
            lifecycle.migration_pending = false;
        }

        inner
            .buffer
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned)?
            .ingest(state);
        inner.count(Metric::StateBuffering);

        if !lifecycle.migration_pending && lifecycle.timer.is_none() {
            tracing::info!(
                connection_id = %inner.connection_id,
                period_ms = u64::try_from(inner.config.flush_period.as_millis()).unwrap_or(u64::MAX),
                "Starting state flush timer"
            );
            let (shutdown, receiver) = watch::channel(false);
            let handle = tokio::spawn(run_flush_timer(Arc::clone(inner), receiver));
            lifecycle.timer = Some(FlushTimer { shutdown, handle });
        }
        Ok(())
    }

    /// Flush buffered state and stats now. Failures are logged and kept
    /// for the next flush.
    pub async fn flush(&self) {
        let inner = Arc::clone(&self.inner);
        if let Err(e) = tokio::task::spawn_blocking(move || inner.flush()).await {
            tracing::error!(
                connection_id = %self.inner.connection_id,
                error = %e,
                "Flush task failed"
            );
        }
    }

    /// Stop the periodic flush and write what is left.
    ///
    /// Waits for the timer task and for any in-flight flush, scheduled or
    /// explicit, sharing one termination timeout. If that wait times out or
    /// the timer task failed, the final write is skipped and `Ok` is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Closed`] on a second call,
    /// [`PersistenceError::MigrationIncomplete`] when a legacy migration
    /// would drop an incremental stream's state, and
    /// [`PersistenceError::StateFlushExhausted`] or
    /// [`PersistenceError::StatsFlushExhausted`] when the final writes keep
    /// failing.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        let (timer, migration_pending) = {
            let mut lifecycle = inner
                .lifecycle
                .lock()
                .map_err(|_| PersistenceError::LockPoisoned)?;
            if lifecycle.phase == Phase::Closed {
                return Err(PersistenceError::Closed);
            }
            lifecycle.phase = Phase::Closed;
            (lifecycle.timer.take(), lifecycle.migration_pending)
        };
        let deadline = Instant::now() + inner.config.flush_termination_timeout;

        if let Some(FlushTimer {
            shutdown,
            mut handle,
        }) = timer
        {
            shutdown.send_replace(true);
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e)) | Err(e)) => {
                    tracing::warn!(
                        connection_id = %inner.connection_id,
                        error = %e,
                        "State flush timer failed while stopping, most recent states may have been lost"
                    );
                    self.skip_final_flush();
                    return Ok(());
                }
                Err(_) => {
                    handle.abort();
                    self.warn_flush_timed_out();
                    self.skip_final_flush();
                    return Ok(());
                }
            }
        }

        // An explicit flush() may still hold the slot.
        let Ok(slot) = tokio::time::timeout_at(deadline, inner.flush_slot.lock()).await else {
            self.warn_flush_timed_out();
            self.skip_final_flush();
            return Ok(());
        };
        self.final_flush(slot, migration_pending).await
    }

    fn warn_flush_timed_out(&self) {
        tracing::warn!(
            connection_id = %self.inner.connection_id,
            timeout_ms = u64::try_from(self.inner.config.flush_termination_timeout.as_millis())
                .unwrap_or(u64::MAX),
            "Pending flush took too long to complete, most recent states may have been lost"
        );
    }

    fn skip_final_flush(&self) {
        if self.inner.has_pending_state() {
            self.inner.emit_close_not_attempted();
        }
    }

    async fn final_flush(
        &self,
        mut slot: tokio::sync::MutexGuard<'_, FlushSlot>,
        migration_pending: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        let (document, stats) = {
            inner.prepare(&mut slot)?;
            let document = slot.state.take().and_then(|agg| agg.aggregated());
            let stats = slot.stats.take();
            drop(slot);
            (document, stats)
        };

        if let Some(document) = document {
            if migration_pending {
                if let Err(e) = validate_stream_migration(&document, &inner.catalog) {
                    tracing::error!(connection_id = %inner.connection_id, error = %e, "Refusing to persist incomplete migrated state");
                    inner.emit_close_not_attempted();
                    return Err(e);
                }
            }

            let writer = Arc::clone(inner);
            let result = retry_blocking(&inner.config.retry, "flush_state", move || {
                writer.write_state(&document)
            })
            .await;
            if let Err(exhausted) = result {
                inner.emit_close_not_attempted();
                return Err(PersistenceError::StateFlushExhausted {
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                });
            }
        }
        inner.count(Metric::StateCommitCloseSuccessful);

        if let Some(stats) = stats {
            let writer = Arc::clone(inner);
            let result = retry_blocking(&inner.config.retry, "flush_stats", move || {
                writer.write_stats(&stats)
            })
            .await;
            if let Err(exhausted) = result {
                inner.count(Metric::StatsCommitNotAttempted);
                return Err(PersistenceError::StatsFlushExhausted {
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                });
            }
        }
        inner.count(Metric::StatsCommitCloseSuccessful);

        tracing::info!(connection_id = %inner.connection_id, "Sync persistence closed");
        Ok(())
    }

    fn is_closed(&self) -> Result<bool> {
        let lifecycle = self
            .inner
            .lifecycle
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned)?;
        Ok(lifecycle.phase == Phase::Closed)
    }

    // ── Stats delegation ────────────────────────────────────────────

    /// The tracker behind this flusher, for the read-only accessors.
    #[must_use]
    pub fn tracker(&self) -> &StreamStatsTracker {
        &self.inner.tracker
    }

    pub fn update_stats(&self, record: &RecordMessage) {
        self.inner.receiving_stats.store(true, Ordering::Release);
        self.inner.tracker.update_stats(record);
    }

    pub fn update_estimates(&self, estimate: &EstimateMessage) {
        self.inner.receiving_stats.store(true, Ordering::Release);
        self.inner.tracker.update_estimates(estimate);
    }

    /// Stage a source checkpoint in the tracker.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::InvalidChecksum`] when
    /// `fail_on_invalid_checksum` is set and the checkpoint's record count
    /// disagrees with the records seen since the previous one.
    pub fn update_source_states_stats(&self, state: &StateMessage) -> Result<()> {
        self.inner.receiving_stats.store(true, Ordering::Release);
        let mismatch = self.inner.tracker.record_source_checkpoint(state);
        self.check_checksum(mismatch)
    }

    /// Commit a destination acknowledgment in the tracker.
    ///
    /// # Errors
    ///
    /// Same as [`update_source_states_stats`](Self::update_source_states_stats).
    pub fn update_destination_state_stats(&self, state: &StateMessage) -> Result<()> {
        self.inner.receiving_stats.store(true, Ordering::Release);
        let mismatch = self.inner.tracker.record_destination_checkpoint(state);
        self.check_checksum(mismatch)
    }

    fn check_checksum(&self, mismatch: Option<ChecksumMismatch>) -> Result<()> {
        match mismatch {
            Some(mismatch) if self.inner.config.fail_on_invalid_checksum => {
                Err(PersistenceError::InvalidChecksum(mismatch))
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn get_total_stats(&self, has_replication_completed: bool) -> SyncStats {
        self.inner.tracker.get_total_stats(has_replication_completed)
    }

    #[must_use]
    pub fn get_all_stream_sync_stats(&self, has_replication_completed: bool) -> Vec<StreamSyncStats> {
        self.inner
            .tracker
            .get_all_stream_sync_stats(has_replication_completed)
    }
}

impl Drop for SyncPersistence {
    fn drop(&mut self) {
        if let Ok(mut lifecycle) = self.inner.lifecycle.lock() {
            if let Some(timer) = lifecycle.timer.take() {
                timer.shutdown.send_replace(true);
            }
        }
    }
}

impl std::fmt::Debug for SyncPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPersistence")
            .field("connection_id", &self.inner.connection_id)
            .field("attempt", &self.inner.attempt)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
