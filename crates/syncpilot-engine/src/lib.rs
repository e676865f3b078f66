//! Durable per-connection sync orchestration.
//!
//! One [`ConnectionOrchestrator`] drives a connection forever: it waits for
//! the schedule (or a signal), creates a job and an attempt, checks both
//! connectors, runs the sync, and reports the outcome. Failed attempts are
//! retried under a [`RetryManager`] budget. Every external effect goes
//! through the collaborator traits in [`activities`].

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod activities;
pub mod check;
pub mod config;
pub mod errors;
pub mod failure;
pub mod flags;
pub mod handle;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod post_processing;
pub mod request;
pub mod retry;
pub mod runner;
pub mod scheduling;
pub mod supervisor;
pub mod workflow_state;

pub use activities::Activities;
pub use config::{parse_config, validate_config, OrchestratorConfig};
pub use errors::{CheckResultError, ChildOperationError};
pub use handle::ConnectionHandle;
pub use orchestrator::{ConnectionOrchestrator, Iteration, OrchestratorOptions};
pub use request::{JobInformation, RunRequest};
pub use retry::{BackoffPolicy, RetryManager, RetryPolicy};
pub use supervisor::{default_activities, orchestrator_options, ConnectionSupervisor};
pub use workflow_state::{WorkflowState, WorkflowStateSnapshot};
