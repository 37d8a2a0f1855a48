//! Named counters emitted by the tracker and the flusher.
//!
//! The sink is an explicit dependency ([`MetricClient`]) handed to each
//! constructor. [`TracingMetricClient`] forwards to `tracing`,
//! [`RecordingMetricClient`] keeps counts in memory.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

// ── Metric names ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Source re-emitted a checkpoint still awaiting acknowledgment.
    StateErrorCollisionFromSource,
    /// Destination acknowledged a checkpoint that is not pending.
    StateErrorUnknownFromDestination,
    /// Connector-reported record count disagrees with the platform count.
    StateChecksumCountError,
    StateBuffering,
    StateCommitAttempt,
    StateCommitAttemptFailed,
    StateCommitAttemptSuccessful,
    StateCommitNotAttempted,
    StateCommitCloseSuccessful,
    StatsCommitAttempt,
    StatsCommitAttemptFailed,
    StatsCommitAttemptSuccessful,
    StatsCommitNotAttempted,
    StatsCommitCloseSuccessful,
}

impl Metric {
    /// Exported metric name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::StateErrorCollisionFromSource => "state_error_collision_from_source",
            Self::StateErrorUnknownFromDestination => "state_error_unknown_from_destination",
            Self::StateChecksumCountError => "state_checksum_count_error",
            Self::StateBuffering => "state_buffering",
            Self::StateCommitAttempt => "state_commit_attempt",
            Self::StateCommitAttemptFailed => "state_commit_attempt_failed",
            Self::StateCommitAttemptSuccessful => "state_commit_attempt_successful",
            Self::StateCommitNotAttempted => "state_commit_not_attempted",
            Self::StateCommitCloseSuccessful => "state_commit_close_successful",
            Self::StatsCommitAttempt => "stats_commit_attempt",
            Self::StatsCommitAttemptFailed => "stats_commit_attempt_failed",
            Self::StatsCommitAttemptSuccessful => "stats_commit_attempt_successful",
            Self::StatsCommitNotAttempted => "stats_commit_not_attempted",
            Self::StatsCommitCloseSuccessful => "stats_commit_close_successful",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Key-value dimension attached to a metric observation.
pub type MetricAttribute<'a> = (&'static str, &'a str);

// ── Sinks ───────────────────────────────────────────────────────────

/// Counter sink.
///
/// Implementations must be `Send + Sync` for use behind
/// `Arc<dyn MetricClient>` and must not block.
pub trait MetricClient: Send + Sync {
    fn count(&self, metric: Metric, value: u64, attributes: &[MetricAttribute<'_>]);
}

/// Emits every observation as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricClient;

impl MetricClient for TracingMetricClient {
    fn count(&self, metric: Metric, value: u64, attributes: &[MetricAttribute<'_>]) {
        tracing::debug!(
            target: "syncledger::metrics",
            metric = metric.name(),
            value,
            attributes = ?attributes,
            "metric"
        );
    }
}

/// Discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricClient;

impl MetricClient for NoopMetricClient {
    fn count(&self, _metric: Metric, _value: u64, _attributes: &[MetricAttribute<'_>]) {}
}

/// Accumulates counts in memory, ignoring attributes.
#[derive(Debug, Default)]
pub struct RecordingMetricClient {
    counts: Mutex<HashMap<Metric, u64>>,
}

impl RecordingMetricClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total recorded for `metric`, zero if never counted.
    #[must_use]
    pub fn get(&self, metric: Metric) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&metric)
            .copied()
            .unwrap_or(0)
    }

    /// Copy of every recorded total.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<Metric, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricClient for RecordingMetricClient {
    fn count(&self, metric: Metric, value: u64, _attributes: &[MetricAttribute<'_>]) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(metric).or_insert(0) += value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_client_accumulates() {
        let client = RecordingMetricClient::new();
        client.count(Metric::StateBuffering, 1, &[]);
        client.count(Metric::StateBuffering, 2, &[("connection_id", "c")]);
        assert_eq!(client.get(Metric::StateBuffering), 3);
        assert_eq!(client.get(Metric::StateCommitAttempt), 0);
        assert_eq!(client.snapshot().len(), 1);
    }

    #[test]
    fn metric_names_are_snake_case() {
        assert_eq!(
            Metric::StateErrorCollisionFromSource.to_string(),
            "state_error_collision_from_source"
        );
        assert_eq!(
            Metric::StatsCommitCloseSuccessful.name(),
            "stats_commit_close_successful"
        );
    }

    #[test]
    fn sinks_are_object_safe() {
        let sinks: Vec<Box<dyn MetricClient>> = vec![
            Box::new(TracingMetricClient),
            Box::new(NoopMetricClient),
            Box::new(RecordingMetricClient::new()),
        ];
        for sink in &sinks {
            sink.count(Metric::StateCommitAttempt, 1, &[]);
        }
    }
}
