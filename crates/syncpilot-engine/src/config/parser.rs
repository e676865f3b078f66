//! Configuration YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use syncpilot_types::Connection;

use crate::config::types::OrchestratorConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Replace every `${VAR}` with the variable's value.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let result = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        std::env::var(&cap[1]).unwrap_or_else(|_| {
            missing.push(cap[1].to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        missing.dedup();
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }
    Ok(result.into_owned())
}

/// Parse configuration from a string. Blank input is the default config.
///
/// # Errors
///
/// Returns an error if substitution fails or the YAML is invalid.
pub fn parse_config_str(yaml_str: &str) -> Result<OrchestratorConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    if substituted.trim().is_empty() {
        return Ok(OrchestratorConfig::default());
    }
    serde_yaml::from_str(&substituted).context("Failed to parse syncpilot config YAML")
}

/// Parse a configuration file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or its content is invalid.
pub fn parse_config(path: &Path) -> Result<OrchestratorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config_str(&content)
}

/// Parse a connection definition file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or its content is invalid.
pub fn parse_connection(path: &Path) -> Result<Connection> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read connection file: {}", path.display()))?;
    let substituted = substitute_env_vars(&content)?;
    serde_yaml::from_str(&substituted)
        .with_context(|| format!("Failed to parse connection file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use syncpilot_types::{ConnectionStatus, Schedule, TimeUnit};

    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("SP_TEST_DB_PATH", "/var/lib/syncpilot.db");
        let result = substitute_env_vars("path: ${SP_TEST_DB_PATH}").unwrap();
        assert_eq!(result, "path: /var/lib/syncpilot.db");
        std::env::remove_var("SP_TEST_DB_PATH");
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "scheduling:\n  max_attempts: 4";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_missing_env_vars_all_reported() {
        let err = substitute_env_vars("${SP_MISSING_X} and ${SP_MISSING_Y}").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("SP_MISSING_X"));
        assert!(msg.contains("SP_MISSING_Y"));
    }

    #[test]
    fn test_blank_config_is_default() {
        assert_eq!(parse_config_str("").unwrap(), OrchestratorConfig::default());
        assert_eq!(parse_config_str("  \n").unwrap(), OrchestratorConfig::default());
    }

    #[test]
    fn test_parse_config_with_substitution() {
        std::env::set_var("SP_TEST_MAX_ATTEMPTS", "7");
        let config = parse_config_str("scheduling:\n  max_attempts: ${SP_TEST_MAX_ATTEMPTS}\n").unwrap();
        assert_eq!(config.scheduling.max_attempts, 7);
        std::env::remove_var("SP_TEST_MAX_ATTEMPTS");
    }

    #[test]
    fn test_parse_invalid_yaml_errors() {
        assert!(parse_config_str("this is not: [valid: yaml: {{{}}}").is_err());
    }

    #[test]
    fn test_parse_config_file_not_found() {
        let err = parse_config(Path::new("/nonexistent/syncpilot.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_parse_connection_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r"
connection_id: 9d1c4d4e-5b7f-4b43-9d0e-0b6f2f1f8a10
workspace_id: 3f0c2a5e-1d4b-4c8a-8f1e-2a9b7c6d5e4f
source_id: 6a7b8c9d-0e1f-4a2b-8c3d-4e5f6a7b8c9d
destination_id: 1a2b3c4d-5e6f-4a7b-8c9d-0e1f2a3b4c5d
status: active
schedule:
  type: basic
  units: 6
  time_unit: hours
"
        )
        .unwrap();

        let connection = parse_connection(file.path()).unwrap();
        assert_eq!(connection.status, ConnectionStatus::Active);
        assert_eq!(connection.schedule, Schedule::Basic { units: 6, time_unit: TimeUnit::Hours });
    }
}
