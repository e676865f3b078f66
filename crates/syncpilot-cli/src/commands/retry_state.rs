use anyhow::Result;
use syncpilot_engine::{OrchestratorConfig, RetryManager};
use syncpilot_state::StateBackend;
use syncpilot_types::ConnectionId;

/// Execute the `retry-state` command: print the latest retry counters.
pub fn execute(config: &OrchestratorConfig, connection_id: ConnectionId) -> Result<()> {
    let state = super::open_state(config)?;

    let Some((job_id, counters)) = state.latest_retry_counters(connection_id)? else {
        println!("No retry state for connection {connection_id}.");
        return Ok(());
    };

    let manager = RetryManager::hydrate(config.retry, counters);
    println!("Job {job_id}");
    println!(
        "  Successive complete failures: {}/{}",
        manager.successive_complete_failures(),
        config.retry.successive_complete_failure_limit
    );
    println!("  Total complete failures:      {}", manager.total_complete_failures());
    println!(
        "  Successive partial failures:  {}/{}",
        manager.successive_partial_failures(),
        config.retry.successive_partial_failure_limit
    );
    println!("  Total partial failures:       {}", manager.total_partial_failures());
    println!("  Next backoff:                 {}", syncpilot_engine::retry::format_duration(manager.backoff()));
    println!(
        "  Will retry:                   {}",
        if manager.should_retry() { "yes" } else { "no" }
    );
    Ok(())
}
