//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for registered connections,
//! job and attempt history, attempt logs, retry counters, stream-reset
//! records and persisted run requests. Model types live in
//! [`syncpilot_types`].

use chrono::{DateTime, Utc};
use syncpilot_types::{
    AttemptFailureSummary, AttemptNumber, AttemptRecord, AttemptStatus, Connection,
    ConnectionId, ConnectionStatus, JobId, JobKind, JobRecord, JobStatus, RetryCounters,
    SyncStats,
};

use crate::error;

/// One line appended to an attempt's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLogLine {
    pub level: String,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

/// Storage contract for orchestrator state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    // -- connections ------------------------------------------------------

    /// Insert or replace a registered connection.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn upsert_connection(&self, connection: &Connection) -> error::Result<()>;

    /// Read a registered connection. `Ok(None)` when it was never registered.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_connection(&self, connection_id: ConnectionId) -> error::Result<Option<Connection>>;

    /// All registered connections.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_connections(&self) -> error::Result<Vec<Connection>>;

    /// Change the status of a connection, e.g. when it is auto-disabled.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnknownConnection`](crate::error::StateError::UnknownConnection)
    /// if the connection is not registered.
    fn set_connection_status(
        &self,
        connection_id: ConnectionId,
        status: ConnectionStatus,
    ) -> error::Result<()>;

    // -- jobs -------------------------------------------------------------

    /// Create a `pending` job and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn create_job(
        &self,
        connection_id: ConnectionId,
        kind: JobKind,
        scheduled: bool,
    ) -> error::Result<JobId>;

    /// Read one job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_job(&self, job_id: JobId) -> error::Result<Option<JobRecord>>;

    /// Jobs of a connection, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_jobs(&self, connection_id: ConnectionId) -> error::Result<Vec<JobRecord>>;

    /// Set the status (and optionally the failure reason) of a job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnknownJob`](crate::error::StateError::UnknownJob)
    /// if the job does not exist.
    fn update_job_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        failure_reason: Option<&str>,
    ) -> error::Result<()>;

    /// Record when the job first started running. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn mark_job_started(&self, job_id: JobId) -> error::Result<()>;

    /// Store totals computed across the job's attempts.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn set_job_stats(&self, job_id: JobId, stats: &SyncStats) -> error::Result<()>;

    // -- attempts ---------------------------------------------------------

    /// Create the next `running` attempt of a job and return its 0-based index.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::UnknownJob`](crate::error::StateError::UnknownJob)
    /// if the job does not exist.
    fn create_attempt(&self, job_id: JobId) -> error::Result<AttemptNumber>;

    /// Read one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_attempt(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
    ) -> error::Result<Option<AttemptRecord>>;

    /// Attempts of a job in creation order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn list_attempts(&self, job_id: JobId) -> error::Result<Vec<AttemptRecord>>;

    /// Close an attempt with its outcome, stats and failure summary.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn finish_attempt(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
        status: AttemptStatus,
        stats: Option<&SyncStats>,
        failure_summary: Option<&AttemptFailureSummary>,
    ) -> error::Result<()>;

    /// Append a line to an attempt's log.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn append_attempt_log(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
        level: &str,
        message: &str,
    ) -> error::Result<()>;

    /// Log lines of an attempt in append order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn attempt_logs(
        &self,
        job_id: JobId,
        attempt_number: AttemptNumber,
    ) -> error::Result<Vec<AttemptLogLine>>;

    // -- retry counters ---------------------------------------------------

    /// Counters persisted for a (connection, job) pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get_retry_counters(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
    ) -> error::Result<Option<RetryCounters>>;

    /// Upsert counters for a (connection, job) pair.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put_retry_counters(
        &self,
        connection_id: ConnectionId,
        job_id: JobId,
        counters: &RetryCounters,
    ) -> error::Result<()>;

    /// The most recently written counters of a connection, with their job.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn latest_retry_counters(
        &self,
        connection_id: ConnectionId,
    ) -> error::Result<Option<(JobId, RetryCounters)>>;

    // -- stream resets ----------------------------------------------------

    /// Flag streams of a connection for reset. Duplicates are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn add_stream_resets(&self, connection_id: ConnectionId, streams: &[String]) -> error::Result<()>;

    /// Streams currently flagged for reset.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn pending_stream_resets(&self, connection_id: ConnectionId) -> error::Result<Vec<String>>;

    /// Clear every reset flag of a connection, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn delete_stream_resets(&self, connection_id: ConnectionId) -> error::Result<u64>;

    // -- run requests -----------------------------------------------------

    /// Persist the serialized run request a connection's loop continues with.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn save_run_request(&self, connection_id: ConnectionId, payload: &str) -> error::Result<()>;

    /// The last saved run request of a connection, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn load_run_request(&self, connection_id: ConnectionId) -> error::Result<Option<String>>;
}
