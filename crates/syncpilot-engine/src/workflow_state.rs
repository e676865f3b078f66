//! Externally observable state of a connection's loop.
//!
//! Callers see the familiar boolean flags (`is_running`, `is_cancelled`, ...)
//! but the state is held as a [`Phase`] and an [`Outcome`], so combinations
//! such as "succeeded and failed" cannot be represented.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where the current iteration is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the schedule.
    Waiting,
    /// Resuming a failed attempt; still waiting out the backoff.
    BackingOff,
    /// Past the wait, job not started yet.
    DoneWaiting,
    /// Job started.
    Running,
}

impl Phase {
    fn is_running(self) -> bool {
        matches!(self, Self::BackingOff | Self::Running)
    }

    fn is_done_waiting(self) -> bool {
        matches!(self, Self::DoneWaiting | Self::Running)
    }

    fn from_flags(running: bool, done_waiting: bool) -> Self {
        match (running, done_waiting) {
            (false, false) => Self::Waiting,
            (true, false) => Self::BackingOff,
            (false, true) => Self::DoneWaiting,
            (true, true) => Self::Running,
        }
    }
}

/// How the current attempt ended, if it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

/// Flag named in a [`ChangedStateEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Running,
    Deleted,
    Cancelled,
    CancelledForReset,
    Updated,
    Failed,
    Success,
    DoneWaiting,
    SkipScheduling,
    SkipSchedulingNextWorkflow,
}

/// A flag was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedStateEvent {
    pub field: StateField,
    pub value: bool,
}

/// Receives every flag write of a [`WorkflowState`].
pub trait StateChangedListener: Send + Sync {
    fn state_changed(&self, workflow_id: Uuid, event: ChangedStateEvent);
}

/// Point-in-time copy of the flags, returned by state queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStateSnapshot {
    pub id: Uuid,
    pub running: bool,
    pub deleted: bool,
    pub cancelled: bool,
    pub cancelled_for_reset: bool,
    pub updated: bool,
    pub failed: bool,
    pub success: bool,
    pub done_waiting: bool,
    pub skip_scheduling: bool,
    pub skip_scheduling_next_workflow: bool,
}

/// State of one connection's loop.
#[derive(Clone)]
pub struct WorkflowState {
    id: Uuid,
    listener: Option<Arc<dyn StateChangedListener>>,
    phase: Phase,
    outcome: Outcome,
    cancelled_for_reset: bool,
    deleted: bool,
    updated: bool,
    skip_scheduling: bool,
    skip_scheduling_next_workflow: bool,
}

impl fmt::Debug for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowState")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("outcome", &self.outcome)
            .field("cancelled_for_reset", &self.cancelled_for_reset)
            .field("deleted", &self.deleted)
            .field("updated", &self.updated)
            .field("skip_scheduling", &self.skip_scheduling)
            .field("skip_scheduling_next_workflow", &self.skip_scheduling_next_workflow)
            .finish_non_exhaustive()
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new(Uuid::new_v4(), None)
    }
}

impl WorkflowState {
    #[must_use]
    pub fn new(id: Uuid, listener: Option<Arc<dyn StateChangedListener>>) -> Self {
        Self {
            id,
            listener,
            phase: Phase::Waiting,
            outcome: Outcome::Pending,
            cancelled_for_reset: false,
            deleted: false,
            updated: false,
            skip_scheduling: false,
            skip_scheduling_next_workflow: false,
        }
    }

    /// Fresh flags sharing `other`'s identity and listener.
    #[must_use]
    pub fn with_identity_of(other: &Self) -> Self {
        Self::new(other.id, other.listener.clone())
    }

    /// Take `other`'s identity and listener, keeping this state's flags.
    pub fn adopt_identity(&mut self, other: &Self) {
        self.id = other.id;
        self.listener.clone_from(&other.listener);
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn emit(&self, field: StateField, value: bool) {
        if let Some(listener) = &self.listener {
            listener.state_changed(self.id, ChangedStateEvent { field, value });
        }
    }

    // -- queries ----------------------------------------------------------

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase.is_running()
    }

    #[must_use]
    pub fn is_done_waiting(&self) -> bool {
        self.phase.is_done_waiting()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.outcome == Outcome::Cancelled
    }

    #[must_use]
    pub fn is_cancelled_for_reset(&self) -> bool {
        self.cancelled_for_reset
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    #[must_use]
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    #[must_use]
    pub fn is_skip_scheduling(&self) -> bool {
        self.skip_scheduling
    }

    #[must_use]
    pub fn is_skip_scheduling_next_workflow(&self) -> bool {
        self.skip_scheduling_next_workflow
    }

    /// Whether a scheduled wait should end early.
    #[must_use]
    pub fn should_interrupt_wait(&self) -> bool {
        self.skip_scheduling || self.deleted || self.updated || self.is_cancelled()
    }

    #[must_use]
    pub fn snapshot(&self) -> WorkflowStateSnapshot {
        WorkflowStateSnapshot {
            id: self.id,
            running: self.is_running(),
            deleted: self.deleted,
            cancelled: self.is_cancelled(),
            cancelled_for_reset: self.cancelled_for_reset,
            updated: self.updated,
            failed: self.is_failed(),
            success: self.is_success(),
            done_waiting: self.is_done_waiting(),
            skip_scheduling: self.skip_scheduling,
            skip_scheduling_next_workflow: self.skip_scheduling_next_workflow,
        }
    }

    // -- writes -----------------------------------------------------------

    pub fn set_running(&mut self, running: bool) {
        self.phase = Phase::from_flags(running, self.is_done_waiting());
        self.emit(StateField::Running, running);
    }

    pub fn set_done_waiting(&mut self, done_waiting: bool) {
        self.phase = Phase::from_flags(self.is_running(), done_waiting);
        self.emit(StateField::DoneWaiting, done_waiting);
    }

    /// Setting an outcome replaces any other outcome; clearing only clears
    /// the named one.
    fn set_outcome(&mut self, outcome: Outcome, value: bool) {
        if value {
            self.outcome = outcome;
        } else if self.outcome == outcome {
            self.outcome = Outcome::Pending;
        }
    }

    pub fn set_failed(&mut self, failed: bool) {
        self.set_outcome(Outcome::Failed, failed);
        self.emit(StateField::Failed, failed);
    }

    pub fn set_success(&mut self, success: bool) {
        self.set_outcome(Outcome::Succeeded, success);
        self.emit(StateField::Success, success);
    }

    pub fn set_cancelled(&mut self, cancelled: bool) {
        self.set_outcome(Outcome::Cancelled, cancelled);
        self.emit(StateField::Cancelled, cancelled);
    }

    pub fn set_cancelled_for_reset(&mut self, value: bool) {
        self.cancelled_for_reset = value;
        self.emit(StateField::CancelledForReset, value);
    }

    pub fn set_deleted(&mut self, value: bool) {
        self.deleted = value;
        self.emit(StateField::Deleted, value);
    }

    pub fn set_updated(&mut self, value: bool) {
        self.updated = value;
        self.emit(StateField::Updated, value);
    }

    pub fn set_skip_scheduling(&mut self, value: bool) {
        self.skip_scheduling = value;
        self.emit(StateField::SkipScheduling, value);
    }

    pub fn set_skip_scheduling_next_workflow(&mut self, value: bool) {
        self.skip_scheduling_next_workflow = value;
        self.emit(StateField::SkipSchedulingNextWorkflow, value);
    }

    /// Clear everything an iteration accumulates.
    ///
    /// Identity, listener and the deletion flag survive; a deleted
    /// connection never starts another iteration.
    pub fn reset(&mut self) {
        self.set_running(false);
        self.set_done_waiting(false);
        self.set_failed(false);
        self.set_success(false);
        self.set_cancelled(false);
        self.set_cancelled_for_reset(false);
        self.set_updated(false);
        self.set_skip_scheduling(false);
        self.set_skip_scheduling_next_workflow(false);
    }
}
