//! Contracts of the external collaborators the orchestrator calls.
//!
//! Every call returns `anyhow::Result`; the orchestrator decides per call
//! site whether a failure is mandatory (restart the loop) or best-effort
//! (log, meter and substitute a default). Child operations return
//! [`ChildOperationError`] so their failures can be classified.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use syncpilot_types::{
    ActorId, ActorType, AttemptFailureSummary, AttemptNumber, CheckOutput, ConnectionContext,
    ConnectionId, JobId, JobStatus, SyncOutput, WorkflowMetric,
};
use tokio_util::sync::CancellationToken;

use crate::errors::ChildOperationError;
use crate::request::RunRequest;
use crate::retry::RetryManager;

/// Schedule, context and flag lookups.
#[async_trait]
pub trait ConfigFetch: Send + Sync {
    async fn is_workspace_tombstone(&self, connection_id: ConnectionId) -> Result<bool>;

    async fn get_connection_context(&self, connection_id: ConnectionId) -> Result<ConnectionContext>;

    /// How long to hold off before doing anything. Zero means clear.
    async fn get_load_shed_backoff(&self, context: &ConnectionContext) -> Result<Duration>;

    /// Time until the next scheduled run.
    async fn get_time_to_wait(&self, connection_id: ConnectionId) -> Result<Duration>;

    /// Attempt cap used when no retry manager could be hydrated.
    async fn get_max_attempts(&self) -> Result<u32>;

    /// Informational flags, logged at the start of an attempt.
    async fn get_feature_flags(&self, connection_id: ConnectionId) -> Result<BTreeMap<String, bool>>;

    /// Delay before restarting after a failed mandatory call.
    async fn get_workflow_restart_delay(&self) -> Result<Duration>;
}

/// Job and attempt bookkeeping.
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Fail any job or attempt of the connection left non-terminal.
    async fn ensure_clean_job_state(&self, connection_id: ConnectionId) -> Result<()>;

    async fn create_new_job(&self, connection_id: ConnectionId, scheduled: bool) -> Result<JobId>;

    /// Returns the 0-based index of the new attempt.
    async fn create_new_attempt_number(&self, job_id: JobId) -> Result<AttemptNumber>;

    async fn report_job_start(&self, job_id: JobId, connection_id: ConnectionId) -> Result<()>;

    /// Whether the job clears destination data rather than syncing.
    async fn is_reset_job(&self, job_id: JobId) -> Result<bool>;

    /// Whether the previous attempt of this job, or the previous job of the
    /// connection, failed.
    async fn is_last_job_or_attempt_failure(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        connection_id: ConnectionId,
    ) -> Result<bool>;

    async fn job_success(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        connection_id: ConnectionId,
        output: &SyncOutput,
    ) -> Result<()>;

    async fn attempt_failure(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        connection_id: ConnectionId,
        output: Option<&SyncOutput>,
        summary: &AttemptFailureSummary,
    ) -> Result<()>;

    async fn job_failure(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        connection_id: ConnectionId,
        reason: &str,
    ) -> Result<()>;

    async fn job_cancelled(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        connection_id: ConnectionId,
        summary: &AttemptFailureSummary,
    ) -> Result<()>;
}

/// Judgements over a connection's history.
#[async_trait]
pub trait ConnectionHealth: Send + Sync {
    /// Whether the attempt committed anything.
    async fn check_run_progress(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        connection_id: ConnectionId,
    ) -> Result<bool>;

    /// Disable the connection if it keeps failing. Returns whether it is now disabled.
    async fn auto_disable_if_failing_too_much(&self, connection_id: ConnectionId) -> Result<bool>;
}

/// Durable retry counters.
#[async_trait]
pub trait RetryStateStore: Send + Sync {
    async fn hydrate_retry_state(
        &self,
        job_id: Option<JobId>,
        connection_id: ConnectionId,
    ) -> Result<Option<RetryManager>>;

    async fn persist_retry_state(
        &self,
        job_id: JobId,
        connection_id: ConnectionId,
        manager: &RetryManager,
    ) -> Result<()>;
}

/// Stream-reset records, cleared once a reset job succeeds.
#[async_trait]
pub trait StreamResetTracker: Send + Sync {
    async fn delete_stream_reset_records(&self, connection_id: ConnectionId, job_id: JobId) -> Result<()>;
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record_workflow_metric(&self, metric: WorkflowMetric) -> Result<()>;
}

/// Severity of an attempt log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait AttemptLog: Send + Sync {
    async fn append_attempt_log(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        message: &str,
        level: LogLevel,
    ) -> Result<bool>;
}

/// Starts the detached post-processing of a finished job.
///
/// Must return only once the operation has started; it keeps running
/// after the caller goes away.
#[async_trait]
pub trait PostProcessor: Send + Sync {
    async fn start_post_processing(
        &self,
        job_id: JobId,
        connection_id: ConnectionId,
        status: JobStatus,
    ) -> Result<()>;
}

/// A connection check to run as a child operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub connection_id: ConnectionId,
    pub actor_id: ActorId,
    pub actor_type: ActorType,
    pub job_id: JobId,
    pub attempt: AttemptNumber,
}

impl CheckRequest {
    /// Stable id of the child operation.
    #[must_use]
    pub fn operation_id(&self) -> String {
        format!("check_{}_{}", self.job_id, self.actor_type)
    }
}

/// A sync to run as a child operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub connection_id: ConnectionId,
    pub job_id: JobId,
    pub attempt: AttemptNumber,
    pub source_id: ActorId,
    pub destination_id: ActorId,
}

impl SyncRequest {
    #[must_use]
    pub fn operation_id(&self) -> String {
        format!("sync_{}", self.job_id)
    }
}

/// Runs checks and syncs. Implementations must stop and return
/// [`ChildOperationError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait ConnectorRunner: Send + Sync {
    async fn run_check(
        &self,
        request: CheckRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<CheckOutput, ChildOperationError>;

    async fn run_sync(
        &self,
        request: SyncRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<SyncOutput, ChildOperationError>;
}

/// Durable copy of the request a loop continues with.
#[async_trait]
pub trait RunRequestStore: Send + Sync {
    async fn save_run_request(&self, request: &RunRequest) -> Result<()>;

    async fn load_run_request(&self, connection_id: ConnectionId) -> Result<Option<RunRequest>>;
}

/// Every collaborator one orchestrator needs.
#[derive(Clone)]
pub struct Activities {
    pub config: Arc<dyn ConfigFetch>,
    pub jobs: Arc<dyn JobTracker>,
    pub health: Arc<dyn ConnectionHealth>,
    pub retry_state: Arc<dyn RetryStateStore>,
    pub stream_resets: Arc<dyn StreamResetTracker>,
    pub metrics: Arc<dyn MetricsSink>,
    pub attempt_log: Arc<dyn AttemptLog>,
    pub post_processing: Arc<dyn PostProcessor>,
    pub connectors: Arc<dyn ConnectorRunner>,
    pub run_requests: Arc<dyn RunRequestStore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _config(_: &dyn ConfigFetch) {}
        fn _jobs(_: &dyn JobTracker) {}
        fn _health(_: &dyn ConnectionHealth) {}
        fn _retry(_: &dyn RetryStateStore) {}
        fn _resets(_: &dyn StreamResetTracker) {}
        fn _metrics(_: &dyn MetricsSink) {}
        fn _log(_: &dyn AttemptLog) {}
        fn _post(_: &dyn PostProcessor) {}
        fn _connectors(_: &dyn ConnectorRunner) {}
        fn _requests(_: &dyn RunRequestStore) {}
    }

    #[test]
    fn child_operation_ids() {
        let check = CheckRequest {
            connection_id: ConnectionId::random(),
            actor_id: ActorId::random(),
            actor_type: ActorType::Destination,
            job_id: 12,
            attempt: 0,
        };
        assert_eq!(check.operation_id(), "check_12_destination");

        let sync = SyncRequest {
            connection_id: ConnectionId::random(),
            job_id: 12,
            attempt: 1,
            source_id: ActorId::random(),
            destination_id: ActorId::random(),
        };
        assert_eq!(sync.operation_id(), "sync_12");
    }
}
