//! Serializable flusher settings and their runtime form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::persistence::SyncPersistenceConfig;
use crate::retry::{uniform_jitter, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceSettings {
    #[serde(default = "default_flush_period_secs")]
    pub flush_period_secs: u64,
    /// Zero runs the first scheduled flush as soon as the timer starts.
    #[serde(default)]
    pub flush_initial_delay_secs: u64,
    #[serde(default = "default_flush_termination_timeout_secs")]
    pub flush_termination_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Abort the sync when connector record counts disagree with the platform.
    #[serde(default)]
    pub fail_on_invalid_checksum: bool,
}

fn default_flush_period_secs() -> u64 {
    10
}
fn default_flush_termination_timeout_secs() -> u64 {
    60
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            flush_period_secs: default_flush_period_secs(),
            flush_initial_delay_secs: 0,
            flush_termination_timeout_secs: default_flush_termination_timeout_secs(),
            retry: RetrySettings::default(),
            fail_on_invalid_checksum: false,
        }
    }
}

/// Final-flush retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_jitter_max_secs")]
    pub jitter_max_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_secs() -> u64 {
    10
}
fn default_jitter_max_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            jitter_max_secs: default_jitter_max_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_secs(settings.base_delay_secs),
            jitter_max: Duration::from_secs(settings.jitter_max_secs),
            jitter: uniform_jitter,
            max_attempts: settings.max_attempts,
        }
    }
}

impl From<&PersistenceSettings> for SyncPersistenceConfig {
    fn from(settings: &PersistenceSettings) -> Self {
        Self {
            flush_period: Duration::from_secs(settings.flush_period_secs),
            flush_initial_delay: Duration::from_secs(settings.flush_initial_delay_secs),
            flush_termination_timeout: Duration::from_secs(settings.flush_termination_timeout_secs),
            retry: RetryPolicy::from(&settings.retry),
            fail_on_invalid_checksum: settings.fail_on_invalid_checksum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let config = SyncPersistenceConfig::from(&PersistenceSettings::default());
        let runtime = SyncPersistenceConfig::default();
        assert_eq!(config.flush_period, runtime.flush_period);
        assert_eq!(config.flush_initial_delay, runtime.flush_initial_delay);
        assert_eq!(
            config.flush_termination_timeout,
            runtime.flush_termination_timeout
        );
        assert_eq!(config.retry.base_delay, runtime.retry.base_delay);
        assert_eq!(config.retry.jitter_max, runtime.retry.jitter_max);
        assert_eq!(config.retry.max_attempts, runtime.retry.max_attempts);
        assert_eq!(
            config.fail_on_invalid_checksum,
            runtime.fail_on_invalid_checksum
        );
    }

    #[test]
    fn test_checksum_failure_opt_in() {
        let settings: PersistenceSettings =
            serde_yaml::from_str("fail_on_invalid_checksum: true\n").unwrap();
        assert!(SyncPersistenceConfig::from(&settings).fail_on_invalid_checksum);
    }

    #[test]
    fn test_deserialize_partial_retry() {
        let settings: PersistenceSettings =
            serde_yaml::from_str("flush_period_secs: 30\nretry:\n  max_attempts: 2\n").unwrap();
        assert_eq!(settings.flush_period_secs, 30);
        assert_eq!(settings.flush_termination_timeout_secs, 60);
        assert_eq!(settings.retry.max_attempts, 2);
        assert_eq!(settings.retry.base_delay_secs, 10);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<PersistenceSettings, _> = serde_yaml::from_str("flush_every: 3\n");
        assert!(result.is_err());
    }
}
