//! Outputs of the two child operations: connection checks and syncs.

use serde::{Deserialize, Serialize};

use crate::failure::FailureReason;

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Terminal status reported by the sync execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    Completed,
    Failed,
    Cancelled,
}

impl ReplicationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Volume counters of one sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    #[serde(default)]
    pub records_emitted: u64,
    #[serde(default)]
    pub records_committed: u64,
    #[serde(default)]
    pub bytes_emitted: u64,
    #[serde(default)]
    pub bytes_committed: u64,
}

/// Summary of one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub status: ReplicationStatus,
    #[serde(default)]
    pub stats: SyncStats,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

impl SyncSummary {
    #[must_use]
    pub fn new(status: ReplicationStatus) -> Self {
        Self { status, stats: SyncStats::default(), start_time: None, end_time: None }
    }

    #[must_use]
    pub fn with_stats(mut self, stats: SyncStats) -> Self {
        self.stats = stats;
        self
    }
}

/// Everything the sync execution unit hands back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncSummary>,
    #[serde(default)]
    pub failures: Vec<FailureReason>,
}

impl SyncOutput {
    #[must_use]
    pub fn status(&self) -> Option<ReplicationStatus> {
        self.summary.as_ref().map(|s| s.status)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status() == Some(ReplicationStatus::Failed)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status() == Some(ReplicationStatus::Cancelled)
    }

    /// Records committed by the destination, zero when unknown.
    #[must_use]
    pub fn records_committed(&self) -> u64 {
        self.summary.as_ref().map_or(0, |s| s.stats.records_committed)
    }
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

/// Verdict of a connection check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Succeeded,
    Failed,
}

/// The connector's own answer to a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckConnectionOutput {
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Output of a check child operation.
///
/// A check failed when it produced a failure reason (the connector crashed)
/// or when the connector answered with [`CheckStatus::Failed`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_connection: Option<CheckConnectionOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl CheckOutput {
    #[must_use]
    pub fn succeeded() -> Self {
        Self {
            check_connection: Some(CheckConnectionOutput { status: CheckStatus::Succeeded, message: None }),
            failure_reason: None,
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            check_connection: Some(CheckConnectionOutput {
                status: CheckStatus::Failed,
                message: Some(message.into()),
            }),
            failure_reason: None,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failure_reason.is_some()
            || self
                .check_connection
                .as_ref()
                .is_some_and(|c| c.status == CheckStatus::Failed)
    }
}
