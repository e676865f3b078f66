//! Outcome of the pre-flight connection checks.

use syncpilot_types::{
    AttemptNumber, CheckOutput, FailureOrigin, JobId, ReplicationStatus, SyncOutput, SyncSummary,
};

use crate::errors::CheckResultError;
use crate::failure::{check_failure, unknown_origin_failure};

/// Result of checking the source and destination before a sync.
///
/// Failed exactly when both the failing side and its check output are known.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCheckConnectionResult {
    job_id: JobId,
    attempt_id: AttemptNumber,
    failure: Option<(FailureOrigin, CheckOutput)>,
}

impl SyncCheckConnectionResult {
    #[must_use]
    pub fn new(job_id: JobId, attempt_id: AttemptNumber) -> Self {
        Self { job_id, attempt_id, failure: None }
    }

    /// Record which side failed and what its check said.
    pub fn set_failure(&mut self, origin: FailureOrigin, output: CheckOutput) {
        self.failure = Some((origin, output));
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    #[must_use]
    pub fn failure_origin(&self) -> Option<FailureOrigin> {
        self.failure.as_ref().map(|(origin, _)| *origin)
    }

    #[must_use]
    pub fn failure_output(&self) -> Option<&CheckOutput> {
        self.failure.as_ref().map(|(_, output)| output)
    }

    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[must_use]
    pub fn attempt_id(&self) -> AttemptNumber {
        self.attempt_id
    }

    /// A failed sync output describing the check failure.
    ///
    /// # Errors
    ///
    /// Returns [`CheckResultError::NotFailed`] when no check failed.
    pub fn build_failure_output(&self) -> Result<SyncOutput, CheckResultError> {
        let (origin, output) = self
            .failure
            .as_ref()
            .ok_or(CheckResultError::NotFailed { job_id: self.job_id })?;

        let reason = if let Some(reason) = &output.failure_reason {
            reason.clone()
        } else if let Some(check) = output.check_connection.as_ref().filter(|_| output.is_failed()) {
            check_failure(
                check.message.as_deref().unwrap_or("connection check failed"),
                self.job_id,
                self.attempt_id,
                *origin,
            )
        } else {
            unknown_origin_failure(
                &anyhow::anyhow!("{origin} check failed without details"),
                Some(self.job_id),
                Some(self.attempt_id),
            )
        };

        Ok(SyncOutput {
            summary: Some(SyncSummary::new(ReplicationStatus::Failed)),
            failures: vec![reason],
        })
    }
}
