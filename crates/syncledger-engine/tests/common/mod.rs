//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use serde_json::json;
use syncledger_engine::metrics::RecordingMetricClient;
use syncledger_engine::{RetryPolicy, SyncPersistence, SyncPersistenceConfig, SyncPersistenceDeps};
use syncledger_state::api::{AttemptApi, StateApi};
use syncledger_state::StateError;
use syncledger_types::catalog::ConfiguredCatalog;
use syncledger_types::state::{StateMessage, StateWrapper};
use syncledger_types::stats::SaveStatsRequest;
use syncledger_types::stream::{AttemptContext, ConnectionId, StreamKey};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route engine logs to the test writer. `RUST_LOG` overrides the level.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

pub const CONNECTION: &str = "conn-7f3a";

pub fn connection() -> ConnectionId {
    ConnectionId::new(CONNECTION)
}

pub fn attempt() -> AttemptContext {
    AttemptContext::new(42, 1)
}

pub fn stream_state(name: &str, cursor: i64) -> StateMessage {
    StateMessage::stream(StreamKey::new(name), json!({ "cursor": cursor }))
}

/// Timer that never fires on its own; tests call `flush()` explicitly.
pub fn manual_config() -> SyncPersistenceConfig {
    SyncPersistenceConfig {
        flush_period: Duration::from_secs(3600),
        flush_initial_delay: Duration::from_secs(3600),
        flush_termination_timeout: Duration::from_secs(5),
        retry: RetryPolicy::immediate(3),
        fail_on_invalid_checksum: false,
    }
}

/// Timer that fires immediately and then every 20ms.
pub fn fast_config() -> SyncPersistenceConfig {
    SyncPersistenceConfig {
        flush_period: Duration::from_millis(20),
        flush_initial_delay: Duration::ZERO,
        flush_termination_timeout: Duration::from_secs(5),
        retry: RetryPolicy::immediate(3),
        fail_on_invalid_checksum: false,
    }
}

// ── Mock state API ──────────────────────────────────────────────────

#[derive(Default)]
pub struct MockStateApi {
    stored: Mutex<Option<StateWrapper>>,
    writes: Mutex<Vec<StateWrapper>>,
    write_attempts: AtomicU32,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
    fail_get: AtomicBool,
    panic_on_write: AtomicBool,
    write_delay: Mutex<Duration>,
}

impl MockStateApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_stored(state: StateWrapper) -> Arc<Self> {
        let api = Self::default();
        *api.stored.lock().unwrap() = Some(state);
        Arc::new(api)
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_writes(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    /// Every later write attempt panics, as a broken client would.
    pub fn panic_writes(&self) {
        self.panic_on_write.store(true, Ordering::SeqCst);
    }

    pub fn fail_reads(&self) {
        self.fail_get.store(true, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    /// Successful writes, oldest first.
    pub fn writes(&self) -> Vec<StateWrapper> {
        self.writes.lock().unwrap().clone()
    }

    pub fn write_attempts(&self) -> u32 {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

impl StateApi for MockStateApi {
    fn get_state(&self, _connection: &ConnectionId) -> syncledger_state::error::Result<Option<StateWrapper>> {
        if self.fail_get.load(Ordering::SeqCst) {
            return Err(StateError::remote("state api unavailable"));
        }
        Ok(self.stored.lock().unwrap().clone())
    }

    fn create_or_update_state(
        &self,
        _connection: &ConnectionId,
        state: &StateWrapper,
    ) -> syncledger_state::error::Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        assert!(
            !self.panic_on_write.load(Ordering::SeqCst),
            "state api client panicked"
        );
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(StateError::remote("state write rejected"));
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StateError::remote("state write timed out"));
        }
        *self.stored.lock().unwrap() = Some(state.clone());
        self.writes.lock().unwrap().push(state.clone());
        Ok(())
    }
}

// ── Mock attempt API ────────────────────────────────────────────────

#[derive(Default)]
pub struct MockAttemptApi {
    saved: Mutex<Vec<SaveStatsRequest>>,
    attempts: AtomicU32,
    failures_left: AtomicU32,
    always_fail: AtomicBool,
}

impl MockAttemptApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_saves(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fail_all_saves(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<SaveStatsRequest> {
        self.saved.lock().unwrap().clone()
    }

    pub fn save_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl AttemptApi for MockAttemptApi {
    fn save_stats(&self, request: &SaveStatsRequest) -> syncledger_state::error::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(StateError::remote("stats write rejected"));
        }
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StateError::remote("stats write timed out"));
        }
        self.saved.lock().unwrap().push(request.clone());
        Ok(())
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub struct Harness {
    pub persistence: SyncPersistence,
    pub state_api: Arc<MockStateApi>,
    pub attempt_api: Arc<MockAttemptApi>,
    pub metrics: Arc<RecordingMetricClient>,
}

impl Harness {
    pub fn new(config: SyncPersistenceConfig) -> Self {
        Self::with(MockStateApi::new(), ConfiguredCatalog::default(), config)
    }

    pub fn with(
        state_api: Arc<MockStateApi>,
        catalog: ConfiguredCatalog,
        config: SyncPersistenceConfig,
    ) -> Self {
        init_tracing();
        let attempt_api = MockAttemptApi::new();
        let metrics = Arc::new(RecordingMetricClient::new());
        let deps = SyncPersistenceDeps::new(
            state_api.clone(),
            attempt_api.clone(),
            metrics.clone(),
        );
        let persistence = SyncPersistence::new(connection(), attempt(), catalog, deps, config);
        Self {
            persistence,
            state_api,
            attempt_api,
            metrics,
        }
    }

    pub async fn persist(&self, state: StateMessage) {
        self.persistence
            .persist(&connection(), state)
            .await
            .expect("persist should succeed");
    }
}

/// Poll `condition` every 5ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
