//! Error model for child operations and the orchestrator's internal exits.

use syncpilot_types::{ConnectionId, JobId};

// ---------------------------------------------------------------------------
// ChildOperationError: how a check or sync child operation ended badly
// ---------------------------------------------------------------------------

/// Failure of a cancellable child operation (a connection check or a sync).
///
/// The variant decides how the orchestrator attributes the failure:
/// `Cancelled` is expected and swallowed, `Activity` becomes a failure
/// reason attributed to the named operation, and `Other` becomes an
/// unknown-origin failure.
#[derive(Debug, thiserror::Error)]
pub enum ChildOperationError {
    /// The operation honoured a cancellation request.
    #[error("child operation was cancelled")]
    Cancelled,

    /// A call made by the child operation to an external service failed.
    #[error("activity {operation} failed: {source}")]
    Activity {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChildOperationError {
    /// Wrap an error raised by the named activity.
    pub fn activity(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Activity { operation: operation.into(), source: source.into() }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// CheckResultError
// ---------------------------------------------------------------------------

/// Misuse of a [`SyncCheckConnectionResult`](crate::check::SyncCheckConnectionResult).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CheckResultError {
    #[error("cannot build a failure output for job {job_id} without a failure origin and output")]
    NotFailed { job_id: JobId },
}

// ---------------------------------------------------------------------------
// Exit: non-local control flow inside one orchestrator iteration
// ---------------------------------------------------------------------------

/// Why an iteration stopped before reaching its natural end.
///
/// Propagated with `?` through the iteration and resolved by
/// [`ConnectionOrchestrator::run_iteration`](crate::orchestrator::ConnectionOrchestrator::run_iteration).
#[derive(Debug)]
pub(crate) enum Exit {
    /// Start a fresh iteration with this request.
    ContinueAsNew(crate::request::RunRequest),
    /// The connection is gone; stop the loop for good.
    Stop,
    /// The cancellation scope was cancelled while waiting.
    Cancelled,
    /// A mandatory collaborator call failed.
    ActivityFailed {
        operation: &'static str,
        error: anyhow::Error,
    },
    /// A child operation failed; classified by the attempt driver.
    Child(ChildOperationError),
    /// An invariant was broken or an unexpected error escaped.
    Unexpected(anyhow::Error),
}

impl From<ChildOperationError> for Exit {
    fn from(e: ChildOperationError) -> Self {
        Self::Child(e)
    }
}

impl From<CheckResultError> for Exit {
    fn from(e: CheckResultError) -> Self {
        Self::Unexpected(e.into())
    }
}

pub(crate) type Step<T> = std::result::Result<T, Exit>;

/// Context attached to mandatory-call failures in logs.
pub(crate) fn describe_failure(connection_id: ConnectionId, operation: &str, error: &anyhow::Error) -> String {
    format!("[ACTIVITY-FAILURE] connection {connection_id} failed to run an activity ({operation}): {error:#}")
}
