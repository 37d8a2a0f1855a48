//! Semantic validation of parsed settings.

use anyhow::{bail, Result};

use crate::config::types::PersistenceSettings;

/// Validate parsed settings, reporting every problem at once.
///
/// # Errors
///
/// Returns an error listing all validation failures.
pub fn validate_settings(settings: &PersistenceSettings) -> Result<()> {
    let mut errors = Vec::new();

    if settings.flush_period_secs == 0 {
        errors.push("flush_period_secs must be at least 1".to_string());
    }
    if settings.flush_termination_timeout_secs == 0 {
        errors.push("flush_termination_timeout_secs must be at least 1".to_string());
    }
    if settings.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Persistence settings validation failed:\n  - {}", errors.join("\n  - "));
    }
}
