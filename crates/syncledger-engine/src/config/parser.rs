//! Settings YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::PersistenceSettings;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let substituted = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.sort_unstable();
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }
    Ok(substituted.into_owned())
}

/// Parse a settings YAML string (after env var substitution). An empty
/// document yields the defaults.
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_settings_str(yaml_str: &str) -> Result<PersistenceSettings> {
    let substituted = substitute_env_vars(yaml_str)?;
    if substituted.trim().is_empty() {
        return Ok(PersistenceSettings::default());
    }
    serde_yaml::from_str(&substituted).context("Failed to parse persistence settings YAML")
}

/// Parse a settings YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_settings(path: &Path) -> Result<PersistenceSettings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
    parse_settings_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("SL_TEST_FLUSH_PERIOD", "45");
        let settings = parse_settings_str("flush_period_secs: ${SL_TEST_FLUSH_PERIOD}\n").unwrap();
        assert_eq!(settings.flush_period_secs, 45);
        std::env::remove_var("SL_TEST_FLUSH_PERIOD");
    }

    #[test]
    fn test_missing_env_vars_are_all_reported() {
        let err = substitute_env_vars("a: ${SL_TEST_MISSING_A}\nb: ${SL_TEST_MISSING_B}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("SL_TEST_MISSING_A"));
        assert!(err.contains("SL_TEST_MISSING_B"));
    }

    #[test]
    fn test_repeated_missing_env_var_reported_once() {
        let err = substitute_env_vars("${SL_TEST_MISSING_A} ${SL_TEST_MISSING_B} ${SL_TEST_MISSING_A}")
            .unwrap_err()
            .to_string();
        assert_eq!(err.matches("SL_TEST_MISSING_A").count(), 1, "got: {err}");
        assert_eq!(err.matches("SL_TEST_MISSING_B").count(), 1, "got: {err}");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "flush_period_secs: 5";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(
            parse_settings_str("  \n").unwrap(),
            PersistenceSettings::default()
        );
    }

    #[test]
    fn test_invalid_yaml_has_context() {
        let err = parse_settings_str("flush_period_secs: [1").unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse persistence settings YAML"));
    }

    #[test]
    fn test_parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persistence.yaml");
        std::fs::write(&path, "flush_termination_timeout_secs: 5\n").unwrap();
        let settings = parse_settings(&path).unwrap();
        assert_eq!(settings.flush_termination_timeout_secs, 5);
        assert!(parse_settings(&dir.path().join("absent.yaml")).is_err());
    }
}
