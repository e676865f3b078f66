//! Runs one orchestrator task per connection.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use syncpilot_state::StateBackend;
use syncpilot_types::{Clock, ConnectionId, ConnectionStatus};
use tokio::task::JoinHandle;

use crate::activities::Activities;
use crate::config::types::OrchestratorConfig;
use crate::flags::StaticFeatureFlags;
use crate::handle::ConnectionHandle;
use crate::metrics::TracingMetricsSink;
use crate::orchestrator::{ConnectionOrchestrator, OrchestratorOptions};
use crate::persistence::{blocking, StateActivities};
use crate::post_processing::DetachedPostProcessor;
use crate::request::RunRequest;
use crate::runner::CommandConnectorRunner;
use crate::scheduling::ScheduleConfigFetcher;

/// Collaborators backed by `backend`, with checks and syncs run as the
/// configured commands.
pub fn default_activities(
    config: &OrchestratorConfig,
    backend: Arc<dyn StateBackend>,
    clock: Clock,
) -> Activities {
    let state = Arc::new(StateActivities::new(
        backend.clone(),
        config.retry,
        config.auto_disable,
        clock.clone(),
    ));
    let flags = Arc::new(StaticFeatureFlags::from_config(&config.feature_flags));
    Activities {
        config: Arc::new(ScheduleConfigFetcher::new(
            backend.clone(),
            flags,
            config.scheduling.clone(),
            clock,
        )),
        jobs: state.clone(),
        health: state.clone(),
        retry_state: state.clone(),
        stream_resets: state.clone(),
        metrics: Arc::new(TracingMetricsSink::new()),
        attempt_log: state.clone(),
        post_processing: Arc::new(DetachedPostProcessor::new(backend)),
        connectors: Arc::new(CommandConnectorRunner::new(config.connectors.clone())),
        run_requests: state,
    }
}

/// Loop options taken from the scheduling section.
#[must_use]
pub fn orchestrator_options(config: &OrchestratorConfig) -> OrchestratorOptions {
    OrchestratorOptions {
        check_workspace_tombstone: config.scheduling.check_workspace_tombstone,
        load_shed_backoff: config.scheduling.load_shed_backoff,
        default_workflow_delay: config.scheduling.workflow_delay(),
    }
}

struct Supervised {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
}

/// Owns the loops of many connections.
pub struct ConnectionSupervisor {
    activities: Activities,
    options: OrchestratorOptions,
    loops: HashMap<ConnectionId, Supervised>,
}

impl ConnectionSupervisor {
    #[must_use]
    pub fn new(activities: Activities, options: OrchestratorOptions) -> Self {
        Self { activities, options, loops: HashMap::new() }
    }

    /// Start the loop of `connection_id`, resuming a persisted request when
    /// there is one. Returns the running loop's handle if already started.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted request cannot be read.
    pub async fn start(&mut self, connection_id: ConnectionId) -> Result<ConnectionHandle> {
        if let Some(existing) = self.loops.get(&connection_id) {
            if !existing.task.is_finished() {
                return Ok(existing.handle.clone());
            }
        }

        let request = match self.activities.run_requests.load_run_request(connection_id).await? {
            Some(request) => {
                tracing::info!(
                    %connection_id,
                    job_id = request.job_id,
                    attempt = request.attempt_number,
                    "Resuming connection loop"
                );
                request
            }
            None => RunRequest::new(connection_id),
        };

        let (orchestrator, handle) =
            ConnectionOrchestrator::new(connection_id, self.activities.clone(), self.options.clone());
        let task = tokio::spawn(orchestrator.run(request));
        self.loops
            .insert(connection_id, Supervised { handle: handle.clone(), task });
        tracing::info!(%connection_id, "Started connection loop");
        Ok(handle)
    }

    /// Start a loop for every active connection in `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connections cannot be listed or a loop
    /// cannot be started.
    pub async fn start_all(&mut self, backend: Arc<dyn StateBackend>) -> Result<usize> {
        let connections = blocking(move || backend.list_connections()).await?;
        let mut started = 0;
        for connection in connections {
            if connection.status != ConnectionStatus::Active {
                tracing::debug!(connection_id = %connection.id(), status = %connection.status, "Skipping connection");
                continue;
            }
            self.start(connection.id()).await?;
            started += 1;
        }
        Ok(started)
    }

    #[must_use]
    pub fn handle(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        self.loops.get(&connection_id).map(|s| s.handle.clone())
    }

    pub fn handles(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.loops.values().map(|s| &s.handle)
    }

    /// Whether the loop of `connection_id` has stopped. `None` if never started.
    #[must_use]
    pub fn is_finished(&self, connection_id: ConnectionId) -> Option<bool> {
        self.loops.get(&connection_id).map(|s| s.task.is_finished())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Abort every loop and wait for the tasks to go away.
    pub async fn shutdown(self) {
        for (connection_id, supervised) in self.loops {
            supervised.task.abort();
            if let Err(e) = supervised.task.await {
                if !e.is_cancelled() {
                    tracing::warn!(%connection_id, error = %e, "Connection loop ended abnormally");
                }
            }
        }
        tracing::info!("Supervisor shut down");
    }
}
