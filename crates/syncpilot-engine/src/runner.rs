//! Connector runner that executes external commands for checks and syncs.
//!
//! The command receives its identifiers as `SYNCPILOT_*` environment
//! variables and prints its JSON result on stdout.

use std::process::Stdio;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use syncpilot_types::{CheckOutput, SyncOutput};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::activities::{CheckRequest, ConnectorRunner, SyncRequest};
use crate::config::types::{CommandSpec, ConnectorCommands};
use crate::errors::ChildOperationError;
use crate::failure::{OPERATION_CHECK_DESTINATION, OPERATION_CHECK_SOURCE, OPERATION_SYNC};

const MAX_STDERR_IN_ERROR: usize = 2_000;

/// Runs the configured commands as child processes.
pub struct CommandConnectorRunner {
    commands: ConnectorCommands,
}

impl CommandConnectorRunner {
    #[must_use]
    pub fn new(commands: ConnectorCommands) -> Self {
        Self { commands }
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(MAX_STDERR_IN_ERROR)
        .map_or(0, |(i, _)| i);
    trimmed[start..].to_string()
}

async fn run_command<T: DeserializeOwned>(
    spec: &CommandSpec,
    operation: &'static str,
    env: Vec<(&'static str, String)>,
    cancel: CancellationToken,
) -> Result<T, ChildOperationError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(&spec.env)
        .envs(env)
        .env("SYNCPILOT_OPERATION", operation)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        ChildOperationError::activity(
            operation,
            anyhow::Error::new(e).context(format!("failed to spawn '{}'", spec.program)),
        )
    })?;
    tracing::debug!(operation, program = %spec.program, pid = child.id(), "Started connector command");

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|e| {
            ChildOperationError::activity(operation, anyhow::Error::new(e).context("failed to wait for connector command"))
        })?,
        () = cancel.cancelled() => {
            tracing::info!(operation, program = %spec.program, "Cancelled connector command");
            return Err(ChildOperationError::Cancelled);
        }
    };

    if !output.status.success() {
        return Err(ChildOperationError::Other(anyhow::anyhow!(
            "{operation} command exited with {}: {}",
            output.status,
            tail(&output.stderr)
        )));
    }
    serde_json::from_slice(&output.stdout).map_err(|e| {
        ChildOperationError::Other(
            anyhow::Error::new(e).context(format!("{operation} command printed malformed output")),
        )
    })
}

#[async_trait]
impl ConnectorRunner for CommandConnectorRunner {
    async fn run_check(
        &self,
        request: CheckRequest,
        cancel: CancellationToken,
    ) -> Result<CheckOutput, ChildOperationError> {
        let Some(spec) = &self.commands.check else {
            tracing::debug!(connection_id = %request.connection_id, "No check command configured");
            return Ok(CheckOutput::succeeded());
        };
        let operation = match request.actor_type {
            syncpilot_types::ActorType::Source => OPERATION_CHECK_SOURCE,
            syncpilot_types::ActorType::Destination => OPERATION_CHECK_DESTINATION,
        };
        let env = vec![
            ("SYNCPILOT_CONNECTION_ID", request.connection_id.to_string()),
            ("SYNCPILOT_JOB_ID", request.job_id.to_string()),
            ("SYNCPILOT_ATTEMPT", request.attempt.to_string()),
            ("SYNCPILOT_ACTOR_ID", request.actor_id.to_string()),
            ("SYNCPILOT_ACTOR_TYPE", request.actor_type.to_string()),
            ("SYNCPILOT_OPERATION_ID", request.operation_id()),
        ];
        run_command(spec, operation, env, cancel).await
    }

    async fn run_sync(
        &self,
        request: SyncRequest,
        cancel: CancellationToken,
    ) -> Result<SyncOutput, ChildOperationError> {
        let Some(spec) = &self.commands.sync else {
            return Err(ChildOperationError::activity(
                OPERATION_SYNC,
                anyhow::anyhow!("no sync command configured"),
            ));
        };
        let env = vec![
            ("SYNCPILOT_CONNECTION_ID", request.connection_id.to_string()),
            ("SYNCPILOT_JOB_ID", request.job_id.to_string()),
            ("SYNCPILOT_ATTEMPT", request.attempt.to_string()),
            ("SYNCPILOT_SOURCE_ID", request.source_id.to_string()),
            ("SYNCPILOT_DESTINATION_ID", request.destination_id.to_string()),
            ("SYNCPILOT_OPERATION_ID", request.operation_id()),
        ];
        run_command(spec, OPERATION_SYNC, env, cancel).await
    }
}
