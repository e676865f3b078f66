//! Semantic validation for parsed configuration values.

use anyhow::{bail, Result};

use crate::config::types::{CommandSpec, OrchestratorConfig};
use crate::scheduling::LOAD_SHED_FLAG;

fn validate_command(command: Option<&CommandSpec>, context: &str, errors: &mut Vec<String>) {
    if let Some(command) = command {
        if command.program.trim().is_empty() {
            errors.push(format!("{context}: program must not be empty"));
        }
        for key in command.env.keys() {
            if key.is_empty() || key.contains('=') {
                errors.push(format!("{context}: invalid environment variable name '{key}'"));
            }
        }
    }
}

/// Validate a parsed configuration.
///
/// # Errors
///
/// Returns an error listing every problem found.
pub fn validate_config(config: &OrchestratorConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.state.path.as_os_str().is_empty() {
        errors.push("state.path must not be empty".to_string());
    }

    let retry = &config.retry;
    if retry.successive_complete_failure_limit == 0 {
        errors.push("retry.successive_complete_failure_limit must be > 0".to_string());
    }
    if retry.successive_partial_failure_limit == 0 {
        errors.push("retry.successive_partial_failure_limit must be > 0".to_string());
    }
    if retry.total_complete_failure_limit == Some(0) {
        errors.push("retry.total_complete_failure_limit must be > 0 when set".to_string());
    }
    if retry.total_partial_failure_limit == Some(0) {
        errors.push("retry.total_partial_failure_limit must be > 0 when set".to_string());
    }
    if retry.backoff.base == 0 {
        errors.push("retry.backoff.base must be > 0".to_string());
    }
    if retry.backoff.min_interval_secs > retry.backoff.max_interval_secs {
        errors.push(format!(
            "retry.backoff.min_interval_secs ({}) must not exceed max_interval_secs ({})",
            retry.backoff.min_interval_secs, retry.backoff.max_interval_secs
        ));
    }

    if config.scheduling.max_attempts == 0 {
        errors.push("scheduling.max_attempts must be > 0".to_string());
    }
    for name in &config.scheduling.informational_flags {
        if name.trim().is_empty() {
            errors.push("scheduling.informational_flags: empty flag name".to_string());
        }
    }

    if config.auto_disable.max_failed_jobs_in_a_row == 0 {
        errors.push("auto_disable.max_failed_jobs_in_a_row must be > 0".to_string());
    }
    if config.auto_disable.max_days_of_only_failed_jobs == 0 {
        errors.push("auto_disable.max_days_of_only_failed_jobs must be > 0".to_string());
    }

    if let Some(minutes) = config.feature_flags.integers.get(LOAD_SHED_FLAG) {
        if *minutes < 0 {
            errors.push(format!("feature_flags.integers.{LOAD_SHED_FLAG} must not be negative"));
        }
    }

    validate_command(config.connectors.check.as_ref(), "connectors.check", &mut errors);
    validate_command(config.connectors.sync.as_ref(), "connectors.sync", &mut errors);

    if !errors.is_empty() {
        bail!("Configuration validation failed:\n  - {}", errors.join("\n  - "));
    }
    Ok(())
}
