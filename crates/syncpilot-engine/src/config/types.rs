//! Orchestrator configuration types (`syncpilot.yaml`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Top-level configuration. Every section has defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub state: StateConfig,
    pub retry: RetryPolicy,
    pub scheduling: SchedulingConfig,
    pub auto_disable: AutoDisableConfig,
    pub feature_flags: FeatureFlagConfig,
    pub connectors: ConnectorCommands,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("syncpilot.db")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { path: default_state_path() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Attempt cap used when no retry manager is available.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_workflow_delay_seconds")]
    pub workflow_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub check_workspace_tombstone: bool,
    #[serde(default = "default_true")]
    pub load_shed_backoff: bool,
    /// Flags evaluated and logged at the start of every attempt.
    #[serde(default)]
    pub informational_flags: Vec<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_workflow_delay_seconds() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            workflow_delay_seconds: default_workflow_delay_seconds(),
            check_workspace_tombstone: true,
            load_shed_backoff: true,
            informational_flags: Vec::new(),
        }
    }
}

impl SchedulingConfig {
    #[must_use]
    pub fn workflow_delay(&self) -> Duration {
        Duration::from_secs(self.workflow_delay_seconds)
    }
}

/// Thresholds for disabling a connection that keeps failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDisableConfig {
    #[serde(default = "default_max_failed_jobs_in_a_row")]
    pub max_failed_jobs_in_a_row: u32,
    #[serde(default = "default_max_days_of_only_failed_jobs")]
    pub max_days_of_only_failed_jobs: u32,
}

fn default_max_failed_jobs_in_a_row() -> u32 {
    20
}

fn default_max_days_of_only_failed_jobs() -> u32 {
    14
}

impl Default for AutoDisableConfig {
    fn default() -> Self {
        Self {
            max_failed_jobs_in_a_row: default_max_failed_jobs_in_a_row(),
            max_days_of_only_failed_jobs: default_max_days_of_only_failed_jobs(),
        }
    }
}

/// Static flag values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlagConfig {
    pub booleans: BTreeMap<String, bool>,
    pub integers: BTreeMap<String, i64>,
}

/// External commands run for checks and syncs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorCommands {
    pub check: Option<CommandSpec>,
    pub sync: Option<CommandSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
