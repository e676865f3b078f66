use anyhow::Result;
use syncpilot_engine::OrchestratorConfig;
use syncpilot_state::StateBackend;
use syncpilot_types::ConnectionId;

/// Execute the `jobs` command: print a connection's job history.
pub fn execute(config: &OrchestratorConfig, connection_id: ConnectionId, logs: bool) -> Result<()> {
    let state = super::open_state(config)?;
    let jobs = state.list_jobs(connection_id)?;

    if jobs.is_empty() {
        println!("No jobs for connection {connection_id}.");
        return Ok(());
    }

    for job in &jobs {
        println!(
            "Job {:<6} {:<10} {:<11} created {}",
            job.id,
            job.kind.as_str(),
            job.status.as_str(),
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(reason) = &job.failure_reason {
            println!("  Reason: {reason}");
        }
        if let Some(stats) = &job.stats {
            println!("  Records committed: {}", stats.records_committed);
        }

        for attempt in state.list_attempts(job.id)? {
            println!(
                "  Attempt {:<3} {:<10} records committed {}",
                attempt.attempt_number,
                attempt.status.as_str(),
                attempt.stats.records_committed
            );
            if let Some(summary) = &attempt.failure_summary {
                for failure in &summary.failures {
                    println!(
                        "    {} failure: {}",
                        failure.failure_origin,
                        failure
                            .external_message
                            .as_deref()
                            .or(failure.internal_message.as_deref())
                            .unwrap_or("no message")
                    );
                }
            }
            if logs {
                for line in state.attempt_logs(job.id, attempt.attempt_number)? {
                    println!(
                        "    [{} {}] {}",
                        line.logged_at.format("%H:%M:%S"),
                        line.level,
                        line.message
                    );
                }
            }
        }
    }
    Ok(())
}
