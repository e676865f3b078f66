//! Durable state for the syncpilot orchestrator.
//!
//! Provides the [`StateBackend`] trait and a [`SqliteStateBackend`]
//! implementation for connections, jobs, attempts, attempt logs, retry
//! counters, stream-reset records and persisted run requests.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::{AttemptLogLine, StateBackend};
pub use error::StateError;
pub use sqlite::SqliteStateBackend;
