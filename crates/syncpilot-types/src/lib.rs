//! Shared syncpilot data model.
//!
//! Plain serde types used by the orchestration engine, the state backend and
//! the CLI. Kept in one crate so the state crate never depends on the engine.

pub mod connection;
pub mod failure;
pub mod ids;
pub mod job;
pub mod metric;
pub mod sync;
pub mod time;

pub use connection::{ActorType, Connection, ConnectionContext, ConnectionStatus, Schedule, TimeUnit};
pub use failure::{AttemptFailureSummary, FailureOrigin, FailureReason, FailureType};
pub use ids::{ActorId, AttemptNumber, ConnectionId, JobId, OrganizationId, WorkspaceId};
pub use job::{AttemptRecord, AttemptStatus, JobKind, JobRecord, JobStatus, RetryCounters};
pub use metric::{FailureCause, MetricKind, WorkflowMetric};
pub use sync::{
    CheckConnectionOutput, CheckOutput, CheckStatus, ReplicationStatus, SyncOutput, SyncStats,
    SyncSummary,
};
pub use time::{epoch_millis, fixed_clock, system_clock, Clock};
