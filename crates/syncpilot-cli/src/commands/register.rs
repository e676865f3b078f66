use std::path::Path;

use anyhow::{Context, Result};
use syncpilot_engine::config::parse_connection;
use syncpilot_engine::OrchestratorConfig;
use syncpilot_state::StateBackend;

/// Execute the `register` command: store a connection definition.
pub fn execute(config: &OrchestratorConfig, connection_path: &Path) -> Result<()> {
    let connection = parse_connection(connection_path)?;
    let state = super::open_state(config)?;

    let existed = state.get_connection(connection.id())?.is_some();
    state
        .upsert_connection(&connection)
        .with_context(|| format!("Failed to store connection {}", connection.id()))?;

    tracing::info!(connection_id = %connection.id(), status = %connection.status, "Connection registered");
    println!(
        "{} connection {} ({})",
        if existed { "Updated" } else { "Registered" },
        connection.id(),
        connection.status
    );
    println!("  Schedule: {:?}", connection.schedule);
    Ok(())
}
