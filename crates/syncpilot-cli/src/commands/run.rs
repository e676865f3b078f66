use std::sync::Arc;

use anyhow::{Context, Result};
use syncpilot_engine::{default_activities, orchestrator_options, ConnectionSupervisor, OrchestratorConfig};
use syncpilot_state::StateBackend;
use syncpilot_types::system_clock;

/// Execute the `run` command: drive every active connection until Ctrl-C.
pub async fn execute(config: &OrchestratorConfig) -> Result<()> {
    let backend: Arc<dyn StateBackend> = Arc::new(super::open_state(config)?);

    let activities = default_activities(config, backend.clone(), system_clock());
    let mut supervisor = ConnectionSupervisor::new(activities, orchestrator_options(config));
    let started = supervisor.start_all(backend).await?;

    tracing::info!(
        connections = started,
        state = %config.state.path.display(),
        "Supervisor running"
    );
    if started == 0 {
        println!("No active connections. Register one with `syncpilot register`.");
        return Ok(());
    }
    println!("Running {started} connection(s). Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("Shutting down...");
    supervisor.shutdown().await;
    Ok(())
}
