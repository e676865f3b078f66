//! Signals and queries accepted by a running connection loop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use syncpilot_types::ConnectionId;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::request::JobInformation;
use crate::workflow_state::{WorkflowState, WorkflowStateSnapshot};

/// State shared between a loop and its handles.
///
/// Locks are only held for flag reads and writes, never across an await.
pub(crate) struct Shared {
    state: Mutex<WorkflowState>,
    job: Mutex<JobInformation>,
    scope: Mutex<Option<CancellationToken>>,
    wake: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub(crate) fn new(state: WorkflowState) -> Self {
        Self {
            state: Mutex::new(state),
            job: Mutex::new(JobInformation::non_running()),
            scope: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut WorkflowState) -> R) -> R {
        f(&mut lock(&self.state))
    }

    pub(crate) fn set_job_information(&self, info: JobInformation) {
        *lock(&self.job) = info;
    }

    /// Install a fresh cancellation scope for the inner run.
    pub(crate) fn open_scope(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *lock(&self.scope) = Some(token.clone());
        token
    }

    pub(crate) fn close_scope(&self) {
        lock(&self.scope).take();
    }

    /// Cancel the current scope. Returns whether there was one.
    fn cancel_scope(&self) -> bool {
        match lock(&self.scope).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Future completing on the next [`Shared::wake`]. Registered on creation.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_waiters();
    }
}

/// Cloneable handle to send signals to, and query, one connection's loop.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(connection_id: ConnectionId, shared: Arc<Shared>) -> Self {
        Self { connection_id, shared }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Run now instead of waiting for the schedule. Ignored while a job runs.
    pub fn submit_manual_sync(&self) {
        let accepted = self.shared.with_state(|s| {
            if s.is_running() {
                return false;
            }
            s.set_skip_scheduling(true);
            true
        });
        if accepted {
            tracing::debug!(connection_id = %self.connection_id, "Manual sync submitted");
            self.shared.wake();
        } else {
            tracing::info!(connection_id = %self.connection_id, "Job already running, ignoring manual sync");
        }
    }

    /// Cancel the running job. Ignored when nothing runs.
    pub fn cancel_job(&self) {
        let accepted = self.shared.with_state(|s| {
            if !s.is_running() {
                return false;
            }
            s.set_cancelled(true);
            true
        });
        if !accepted {
            tracing::info!(connection_id = %self.connection_id, "No job running, ignoring cancellation");
            return;
        }
        let had_scope = self.shared.cancel_scope();
        tracing::info!(connection_id = %self.connection_id, had_scope, "Job cancellation requested");
        self.shared.wake();
    }

    /// Stop the loop for good, cancelling any running job first.
    pub fn delete_connection(&self) {
        self.shared.with_state(|s| s.set_deleted(true));
        tracing::info!(connection_id = %self.connection_id, "Connection deleted");
        self.cancel_job();
        self.shared.wake();
    }

    /// The connection's configuration changed; restart at the next check point.
    pub fn connection_updated(&self) {
        self.shared.with_state(|s| s.set_updated(true));
        tracing::debug!(connection_id = %self.connection_id, "Connection updated");
        self.shared.wake();
    }

    /// Run a reset next. Cancels the current job if the wait is over.
    pub fn reset_connection(&self) {
        let cancel = self.shared.with_state(|s| {
            if s.is_done_waiting() {
                s.set_cancelled_for_reset(true);
                true
            } else {
                s.set_skip_scheduling(true);
                false
            }
        });
        if cancel {
            self.shared.cancel_scope();
        }
        tracing::info!(connection_id = %self.connection_id, cancel, "Connection reset requested");
        self.shared.wake();
    }

    /// Like [`reset_connection`](Self::reset_connection), and the run after
    /// the reset skips its schedule too.
    pub fn reset_connection_and_skip_next_scheduling(&self) {
        self.shared.with_state(|s| s.set_skip_scheduling_next_workflow(true));
        self.reset_connection();
    }

    #[must_use]
    pub fn get_state(&self) -> WorkflowStateSnapshot {
        self.shared.with_state(|s| s.snapshot())
    }

    /// Ids of the job and attempt the loop is working on, from the moment
    /// they are created until the iteration ends. Sentinels otherwise.
    #[must_use]
    pub fn get_job_information(&self) -> JobInformation {
        *lock(&self.shared.job)
    }
}
