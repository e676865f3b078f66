//! The minimal state carried from one iteration to the next, and the scratch
//! state owned by a single iteration.
//!
//! Attempt numbering: [`RunRequest::attempt_number`] is the 1-based ordinal
//! of the attempt about to run, while every collaborator call and
//! [`JobInformation`] use the 0-based attempt index returned by attempt
//! creation. `index = ordinal − 1`.

use serde::{Deserialize, Serialize};
use syncpilot_types::{AttemptNumber, ConnectionId, FailureReason, JobId};

use crate::workflow_state::WorkflowState;

fn first_attempt() -> u32 {
    1
}

/// Input of one orchestrator iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub connection_id: ConnectionId,
    /// Set when resuming a job that already exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// 1-based ordinal of the next attempt.
    #[serde(default = "first_attempt")]
    pub attempt_number: u32,
    /// The previous attempt failed and is being retried.
    #[serde(default)]
    pub from_failure: bool,
    /// Run now instead of waiting for the schedule.
    #[serde(default)]
    pub skip_scheduling: bool,
    /// The next job clears destination data rather than syncing.
    #[serde(default)]
    pub reset_connection: bool,
    /// Identity and listener to reuse. Its flags are never copied.
    #[serde(skip)]
    pub workflow_state: Option<WorkflowState>,
}

impl RunRequest {
    /// A fresh request derived from the connection id alone.
    #[must_use]
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            job_id: None,
            attempt_number: first_attempt(),
            from_failure: false,
            skip_scheduling: false,
            reset_connection: false,
            workflow_state: None,
        }
    }

    /// Forget the current job: the next iteration waits for the schedule.
    pub fn reset_to_defaults(&mut self) {
        self.job_id = None;
        self.attempt_number = first_attempt();
        self.from_failure = false;
        self.skip_scheduling = false;
        self.reset_connection = false;
    }

    /// 0-based index of the attempt that last ran for `job_id`.
    #[must_use]
    pub fn attempt_index(&self) -> Option<AttemptNumber> {
        self.job_id.and(self.attempt_number.checked_sub(1))
    }
}

/// Scratch state of one iteration.
#[derive(Debug, Clone, Default)]
pub(crate) struct InternalState {
    pub job_id: Option<JobId>,
    pub attempt_number: Option<AttemptNumber>,
    failures: Vec<FailureReason>,
    pub partial_success: Option<bool>,
}

impl InternalState {
    /// Ids of the job being resumed, if any.
    pub fn from_request(request: &RunRequest) -> Self {
        Self {
            job_id: request.job_id,
            attempt_number: request.attempt_index(),
            ..Self::default()
        }
    }

    /// Add reasons, skipping ones already present. Insertion order is kept.
    pub fn add_failures(&mut self, reasons: impl IntoIterator<Item = FailureReason>) {
        for reason in reasons {
            if !self.failures.contains(&reason) {
                self.failures.push(reason);
            }
        }
    }

    pub fn failures(&self) -> &[FailureReason] {
        &self.failures
    }

    pub fn clear_failures(&mut self) {
        self.failures.clear();
        self.partial_success = None;
    }
}

/// Sentinel job id reported when nothing is running.
pub const NON_RUNNING_JOB_ID: i64 = -1;
/// Sentinel attempt number reported when nothing is running.
pub const NON_RUNNING_ATTEMPT_ID: i64 = -1;

/// Answer to the job information query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInformation {
    pub job_id: i64,
    /// 0-based attempt index.
    pub attempt_number: i64,
}

impl JobInformation {
    #[must_use]
    pub fn non_running() -> Self {
        Self { job_id: NON_RUNNING_JOB_ID, attempt_number: NON_RUNNING_ATTEMPT_ID }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.job_id != NON_RUNNING_JOB_ID
    }
}
