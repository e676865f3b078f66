//! Builders for [`FailureReason`]s and attempt failure summaries.

use chrono::Utc;
use syncpilot_types::{
    AttemptFailureSummary, AttemptNumber, FailureOrigin, FailureReason, FailureType, JobId,
};

/// Longest message kept on a failure reason.
pub const MAX_MESSAGE_LENGTH: usize = 50_000;

/// Most failures kept in one attempt summary.
pub const MAX_FAILURES_TO_KEEP: usize = 10;

pub(crate) const OPERATION_SYNC: &str = "sync";
pub(crate) const OPERATION_CHECK_SOURCE: &str = "check_source";
pub(crate) const OPERATION_CHECK_DESTINATION: &str = "check_destination";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Cut `message` to [`MAX_MESSAGE_LENGTH`] characters.
#[must_use]
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_LENGTH) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}

fn base_reason(
    origin: FailureOrigin,
    error: &anyhow::Error,
    job_id: Option<JobId>,
    attempt: Option<AttemptNumber>,
) -> FailureReason {
    let mut reason = FailureReason::new(origin, now_millis())
        .with_internal_message(truncate_message(&format!("{error:#}")))
        .with_stacktrace(truncate_message(&format!("{error:?}")));
    if let Some(job_id) = job_id {
        reason = reason.with_metadata("job_id", job_id);
    }
    if let Some(attempt) = attempt {
        reason = reason.with_metadata("attempt_number", attempt);
    }
    reason
}

/// A failure nobody can attribute.
#[must_use]
pub fn unknown_origin_failure(
    error: &anyhow::Error,
    job_id: Option<JobId>,
    attempt: Option<AttemptNumber>,
) -> FailureReason {
    base_reason(FailureOrigin::Unknown, error, job_id, attempt)
        .with_external_message("An unknown failure occurred")
}

/// A failure of the orchestrator's own infrastructure.
#[must_use]
pub fn platform_failure(
    error: &anyhow::Error,
    job_id: Option<JobId>,
    attempt: Option<AttemptNumber>,
) -> FailureReason {
    base_reason(FailureOrigin::Platform, error, job_id, attempt)
        .with_type(FailureType::SystemError)
        .with_external_message("Something went wrong within the platform")
}

/// A failure while moving data.
#[must_use]
pub fn replication_failure(
    error: &anyhow::Error,
    job_id: Option<JobId>,
    attempt: Option<AttemptNumber>,
) -> FailureReason {
    base_reason(FailureOrigin::Replication, error, job_id, attempt)
        .with_external_message("Something went wrong during replication")
}

/// A connector rejected its connection check. Never retryable.
#[must_use]
pub fn check_failure(
    message: &str,
    job_id: JobId,
    attempt: AttemptNumber,
    origin: FailureOrigin,
) -> FailureReason {
    let side = match origin {
        FailureOrigin::Source => "source",
        FailureOrigin::Destination => "destination",
        _ => "connector",
    };
    FailureReason::new(origin, now_millis())
        .with_type(FailureType::ConfigError)
        .with_retryable(false)
        .with_internal_message(truncate_message(message))
        .with_external_message(format!("Checking {side} connection failed - please review this connection's configuration to prevent future syncs from failing"))
        .with_metadata("job_id", job_id)
        .with_metadata("attempt_number", attempt)
}

/// Reason for a child operation's activity failure, attributed to that
/// operation.
#[must_use]
pub fn activity_failure(
    operation: &str,
    error: &anyhow::Error,
    job_id: Option<JobId>,
    attempt: Option<AttemptNumber>,
) -> FailureReason {
    let reason = match operation {
        OPERATION_SYNC => return replication_failure(error, job_id, attempt),
        OPERATION_CHECK_SOURCE => base_reason(FailureOrigin::Source, error, job_id, attempt),
        OPERATION_CHECK_DESTINATION => base_reason(FailureOrigin::Destination, error, job_id, attempt),
        _ => return unknown_origin_failure(error, job_id, attempt),
    };
    reason
        .with_type(FailureType::SystemError)
        .with_external_message(format!("Something went wrong while running {operation}"))
}

/// Summary of an attempt's failures, ordered by timestamp.
#[must_use]
pub fn failure_summary(failures: &[FailureReason], partial_success: Option<bool>) -> AttemptFailureSummary {
    let mut ordered = failures.to_vec();
    ordered.sort_by_key(|f| f.timestamp);
    ordered.truncate(MAX_FAILURES_TO_KEEP);
    AttemptFailureSummary { failures: ordered, partial_success }
}

/// Summary recorded when an attempt is cancelled by a user or a reset.
#[must_use]
pub fn failure_summary_for_cancellation(
    job_id: JobId,
    attempt: AttemptNumber,
    failures: &[FailureReason],
    partial_success: Option<bool>,
) -> AttemptFailureSummary {
    let mut all = failures.to_vec();
    all.push(
        FailureReason::new(FailureOrigin::Platform, now_millis())
            .with_type(FailureType::ManualCancellation)
            .with_internal_message("Setting attempt to FAILED because the job was cancelled")
            .with_external_message("This attempt was cancelled")
            .with_metadata("job_id", job_id)
            .with_metadata("attempt_number", attempt),
    );
    failure_summary(&all, partial_success)
}
