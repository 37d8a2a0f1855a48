//! Bounded retry with jitter for the terminal flush.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use syncledger_state::StateError;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_JITTER_MAX: Duration = Duration::from_secs(10);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Maps the configured jitter bound to the extra delay of one retry.
pub type JitterFn = fn(Duration) -> Duration;

/// Uniform jitter in `[0, max]` at millisecond granularity.
#[must_use]
pub fn uniform_jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// No jitter at all.
#[must_use]
pub fn no_jitter(_max: Duration) -> Duration {
    Duration::ZERO
}

/// How the terminal flush retries a failing write.
///
/// Each failed attempt, except the last, is followed by
/// `base_delay + jitter(jitter_max)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub jitter_max: Duration,
    pub jitter: JitterFn,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            jitter_max: DEFAULT_JITTER_MAX,
            jitter: uniform_jitter,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Retry without waiting between attempts.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            jitter_max: Duration::ZERO,
            jitter: no_jitter,
            max_attempts,
        }
    }

    /// Delay before the next attempt.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        self.base_delay + (self.jitter)(self.jitter_max)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Every attempt failed; carries the last error.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: StateError,
}

/// Run a blocking storage call on the blocking pool under `policy`.
///
/// # Errors
///
/// Returns [`RetryExhausted`] once `policy.max_attempts` attempts have
/// failed. A panicking attempt counts as a failed one.
pub async fn retry_blocking<T, F>(
    policy: &RetryPolicy,
    operation: &'static str,
    call: F,
) -> Result<T, RetryExhausted>
where
    T: Send + 'static,
    F: Fn() -> syncledger_state::error::Result<T> + Send + Sync + 'static,
{
    let call = Arc::new(call);
    let max_attempts = policy.attempts();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let this_call = Arc::clone(&call);
        let err = match tokio::task::spawn_blocking(move || this_call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(e) => StateError::remote(format!("{operation} task panicked: {e}")),
        };

        if attempt >= max_attempts {
            tracing::error!(
                operation,
                attempt,
                max_attempts,
                error = %err,
                "Retries exhausted"
            );
            return Err(RetryExhausted {
                attempts: attempt,
                last_error: err,
            });
        }

        let delay = policy.next_delay();
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        tracing::warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms,
            error = %err,
            "Write failed, will retry"
        );
        tokio::time::sleep(delay).await;
    }
}
