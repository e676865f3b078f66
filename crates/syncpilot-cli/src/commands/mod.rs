pub mod jobs;
pub mod register;
pub mod retry_state;
pub mod run;

use std::path::Path;

use anyhow::{Context, Result};
use syncpilot_engine::config::{parse_config, validate_config};
use syncpilot_engine::OrchestratorConfig;
use syncpilot_state::SqliteStateBackend;

/// Parse and validate the config file, or use defaults without one.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig> {
    let config = match path {
        Some(path) => parse_config(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    validate_config(&config)?;
    Ok(config)
}

pub fn open_state(config: &OrchestratorConfig) -> Result<SqliteStateBackend> {
    SqliteStateBackend::open(&config.state.path)
        .with_context(|| format!("Failed to open state database: {}", config.state.path.display()))
}
