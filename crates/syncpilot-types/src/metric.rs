//! Workflow metrics handed to the injected metrics sink.

use serde::{Deserialize, Serialize};

use crate::ids::{AttemptNumber, ConnectionId, JobId};

/// Which workflow counter to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// An orchestrator iteration started.
    WorkflowAttempt,
    WorkflowSuccess,
    WorkflowFailure,
    /// A failed attempt committed records.
    AttemptMadeProgress,
    /// A best-effort collaborator call failed.
    ActivityFailure,
}

impl MetricKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowAttempt => "workflow_attempt",
            Self::WorkflowSuccess => "workflow_success",
            Self::WorkflowFailure => "workflow_failure",
            Self::AttemptMadeProgress => "attempt_made_progress",
            Self::ActivityFailure => "activity_failure",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an iteration ended in failure (or cancellation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Canceled,
    Connection,
    Unknown,
    Activity,
    Workflow,
}

impl FailureCause {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::Connection => "connection",
            Self::Unknown => "unknown",
            Self::Activity => "activity",
            Self::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One metric event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowMetric {
    pub kind: MetricKind,
    pub connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt_number: Option<AttemptNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<(String, String)>,
}

impl WorkflowMetric {
    #[must_use]
    pub fn new(kind: MetricKind, connection_id: ConnectionId) -> Self {
        Self { kind, connection_id, job_id: None, attempt_number: None, cause: None, attributes: Vec::new() }
    }

    #[must_use]
    pub fn with_job(mut self, job_id: Option<JobId>, attempt_number: Option<AttemptNumber>) -> Self {
        self.job_id = job_id;
        self.attempt_number = attempt_number;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: FailureCause) -> Self {
        self.cause = Some(cause);
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push((key.into(), value.to_string()));
        self
    }

    /// Look up an attribute value by key.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}
