//! Schedule evaluation and configuration lookups backed by the state store.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use syncpilot_state::StateBackend;
use syncpilot_types::{
    Clock, Connection, ConnectionContext, ConnectionId, ConnectionStatus, Schedule,
};

use crate::activities::ConfigFetch;
use crate::config::types::SchedulingConfig;
use crate::flags::FeatureFlagClient;
use crate::persistence::blocking;

/// Integer flag holding a connection's load-shed backoff in minutes.
pub const LOAD_SHED_FLAG: &str = "load_shed_backoff_minutes";

const MAX_LOAD_SHED_MINUTES: i64 = 60;

/// Wait used for manual or inactive connections: effectively forever.
pub const WAIT_FOREVER: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Cron schedules never run sooner than this after the last job.
const MIN_CRON_INTERVAL_SECS: i64 = 60;

/// Time until `connection` should run next.
///
/// `last_job_created_at` is the creation time of its most recent job.
///
/// # Errors
///
/// Returns an error for an invalid cron expression.
pub fn time_to_wait(
    connection: &Connection,
    last_job_created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Duration> {
    if connection.status != ConnectionStatus::Active {
        return Ok(WAIT_FOREVER);
    }
    let next_run = match &connection.schedule {
        Schedule::Manual => return Ok(WAIT_FOREVER),
        Schedule::Basic { units, time_unit } => {
            let Some(last) = last_job_created_at else {
                return Ok(Duration::ZERO);
            };
            last + TimeDelta::seconds(i64::from(*units) * time_unit.seconds())
        }
        Schedule::Cron { expression } => {
            let schedule = cron::Schedule::from_str(expression)
                .with_context(|| format!("invalid cron expression '{expression}'"))?;
            let from = last_job_created_at.unwrap_or(now);
            let next = schedule
                .after(&from)
                .next()
                .ok_or_else(|| anyhow!("cron expression '{expression}' has no upcoming run"))?;
            match last_job_created_at {
                Some(last) => next.max(last + TimeDelta::seconds(MIN_CRON_INTERVAL_SECS)),
                None => next,
            }
        }
    };
    Ok((next_run - now).to_std().unwrap_or(Duration::ZERO))
}

/// [`ConfigFetch`] over registered connections and their job history.
pub struct ScheduleConfigFetcher {
    backend: Arc<dyn StateBackend>,
    flags: Arc<dyn FeatureFlagClient>,
    config: SchedulingConfig,
    clock: Clock,
}

impl ScheduleConfigFetcher {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        flags: Arc<dyn FeatureFlagClient>,
        config: SchedulingConfig,
        clock: Clock,
    ) -> Self {
        Self { backend, flags, config, clock }
    }

    async fn connection(&self, connection_id: ConnectionId) -> Result<Connection> {
        let backend = self.backend.clone();
        blocking(move || backend.get_connection(connection_id))
            .await?
            .ok_or_else(|| anyhow!("connection {connection_id} is not registered"))
    }
}

#[async_trait]
impl ConfigFetch for ScheduleConfigFetcher {
    async fn is_workspace_tombstone(&self, connection_id: ConnectionId) -> Result<bool> {
        Ok(self.connection(connection_id).await?.workspace_tombstone)
    }

    async fn get_connection_context(&self, connection_id: ConnectionId) -> Result<ConnectionContext> {
        Ok(self.connection(connection_id).await?.context)
    }

    async fn get_load_shed_backoff(&self, context: &ConnectionContext) -> Result<Duration> {
        let minutes = self
            .flags
            .int_variation(LOAD_SHED_FLAG, context, 0)
            .clamp(0, MAX_LOAD_SHED_MINUTES);
        Ok(Duration::from_secs(u64::try_from(minutes).unwrap_or(0) * 60))
    }

    async fn get_time_to_wait(&self, connection_id: ConnectionId) -> Result<Duration> {
        let connection = self.connection(connection_id).await?;
        let backend = self.backend.clone();
        let jobs = blocking(move || backend.list_jobs(connection_id)).await?;
        let last_created = jobs.iter().map(|job| job.created_at).max();
        let wait = time_to_wait(&connection, last_created, (self.clock)())?;
        tracing::debug!(%connection_id, wait_secs = wait.as_secs(), "Computed time to wait");
        Ok(wait)
    }

    async fn get_max_attempts(&self) -> Result<u32> {
        Ok(self.config.max_attempts)
    }

    async fn get_feature_flags(&self, connection_id: ConnectionId) -> Result<BTreeMap<String, bool>> {
        if self.config.informational_flags.is_empty() {
            return Ok(BTreeMap::new());
        }
        let context = self.connection(connection_id).await?.context;
        Ok(self
            .config
            .informational_flags
            .iter()
            .map(|flag| (flag.clone(), self.flags.bool_variation(flag, &context, false)))
            .collect())
    }

    async fn get_workflow_restart_delay(&self) -> Result<Duration> {
        Ok(self.config.workflow_delay())
    }
}
