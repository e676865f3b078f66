//! Collaborators backed by the durable [`StateBackend`].
//!
//! The backend is synchronous (SQLite behind a mutex), so every call runs on
//! the blocking thread pool.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::TimeDelta;
use syncpilot_state::{error, StateBackend};
use syncpilot_types::{
    AttemptFailureSummary, AttemptNumber, AttemptStatus, Clock, ConnectionId, ConnectionStatus,
    JobId, JobKind, JobRecord, JobStatus, SyncOutput, SyncStats,
};

use crate::activities::{
    AttemptLog, ConnectionHealth, JobTracker, LogLevel, RetryStateStore, RunRequestStore,
    StreamResetTracker,
};
use crate::config::types::AutoDisableConfig;
use crate::failure::{failure_summary, platform_failure};
use crate::request::RunRequest;
use crate::retry::{RetryManager, RetryPolicy};

/// Run a synchronous state call on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(f)
        .await
        .context("state backend task panicked")??)
}

fn output_stats(output: Option<&SyncOutput>) -> Option<SyncStats> {
    output.and_then(|o| o.summary.as_ref()).map(|s| s.stats)
}

/// Decide whether a connection's job history warrants disabling it.
///
/// `jobs` is newest first. Only succeeded and failed jobs count.
pub fn should_auto_disable(
    jobs: &[JobRecord],
    config: &AutoDisableConfig,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    let finished: Vec<&JobRecord> = jobs
        .iter()
        .filter(|j| matches!(j.status, JobStatus::Failed | JobStatus::Succeeded))
        .collect();

    let failed_in_a_row = finished
        .iter()
        .take_while(|j| j.status == JobStatus::Failed)
        .count();
    if failed_in_a_row == 0 {
        return false;
    }
    if failed_in_a_row >= config.max_failed_jobs_in_a_row as usize {
        return true;
    }

    // Oldest failure since the last success.
    let Some(first_failure) = finished.get(failed_in_a_row - 1) else {
        return false;
    };
    let window = TimeDelta::days(i64::from(config.max_days_of_only_failed_jobs));
    now - first_failure.created_at >= window
}

/// Job tracking, retry state, stream resets, attempt logs and run requests
/// over one [`StateBackend`].
#[derive(Clone)]
pub struct StateActivities {
    backend: Arc<dyn StateBackend>,
    policy: RetryPolicy,
    auto_disable: AutoDisableConfig,
    clock: Clock,
}

impl StateActivities {
    pub fn new(
        backend: Arc<dyn StateBackend>,
        policy: RetryPolicy,
        auto_disable: AutoDisableConfig,
        clock: Clock,
    ) -> Self {
        Self { backend, policy, auto_disable, clock }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn StateBackend) -> error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let backend = self.backend.clone();
        blocking(move || f(backend.as_ref())).await
    }

    async fn job(&self, job_id: JobId) -> Result<JobRecord> {
        self.call(move |b| b.get_job(job_id))
            .await?
            .ok_or_else(|| anyhow!("job {job_id} does not exist"))
    }
}

#[async_trait]
impl JobTracker for StateActivities {
    async fn ensure_clean_job_state(&self, connection_id: ConnectionId) -> Result<()> {
        let cleaned = self
            .call(move |b| {
                let mut cleaned = Vec::new();
                for job in b.list_jobs(connection_id)? {
                    if job.status.is_terminal() {
                        continue;
                    }
                    for attempt in b.list_attempts(job.id)? {
                        if attempt.status != AttemptStatus::Running {
                            continue;
                        }
                        let reason = platform_failure(
                            &anyhow!("existing job state was cleaned"),
                            Some(job.id),
                            Some(attempt.attempt_number),
                        );
                        let summary = failure_summary(&[reason], None);
                        b.finish_attempt(
                            job.id,
                            attempt.attempt_number,
                            AttemptStatus::Failed,
                            None,
                            Some(&summary),
                        )?;
                    }
                    b.update_job_status(
                        job.id,
                        JobStatus::Failed,
                        Some("Failing job in order to start from clean job state"),
                    )?;
                    cleaned.push(job.id);
                }
                Ok(cleaned)
            })
            .await?;
        if !cleaned.is_empty() {
            tracing::warn!(%connection_id, jobs = ?cleaned, "Failed orphaned jobs");
        }
        Ok(())
    }

    async fn create_new_job(&self, connection_id: ConnectionId, scheduled: bool) -> Result<JobId> {
        self.call(move |b| {
            let kind = if b.pending_stream_resets(connection_id)?.is_empty() {
                JobKind::Sync
            } else {
                JobKind::Reset
            };
            b.create_job(connection_id, kind, scheduled)
        })
        .await
    }

    async fn create_new_attempt_number(&self, job_id: JobId) -> Result<AttemptNumber> {
        self.call(move |b| b.create_attempt(job_id)).await
    }

    async fn report_job_start(&self, job_id: JobId, _connection_id: ConnectionId) -> Result<()> {
        self.call(move |b| b.mark_job_started(job_id)).await
    }

    async fn is_reset_job(&self, job_id: JobId) -> Result<bool> {
        Ok(self.job(job_id).await?.kind == JobKind::Reset)
    }

    async fn is_last_job_or_attempt_failure(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        connection_id: ConnectionId,
    ) -> Result<bool> {
        if attempt > 0 {
            return Ok(true);
        }
        let jobs = self.call(move |b| b.list_jobs(connection_id)).await?;
        Ok(jobs
            .iter()
            .find(|j| j.id < job_id)
            .is_some_and(|j| j.status == JobStatus::Failed))
    }

    async fn job_success(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        _connection_id: ConnectionId,
        output: &SyncOutput,
    ) -> Result<()> {
        let stats = output_stats(Some(output));
        self.call(move |b| {
            b.finish_attempt(job_id, attempt, AttemptStatus::Succeeded, stats.as_ref(), None)?;
            if let Some(stats) = &stats {
                b.set_job_stats(job_id, stats)?;
            }
            b.update_job_status(job_id, JobStatus::Succeeded, None)
        })
        .await
    }

    async fn attempt_failure(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        _connection_id: ConnectionId,
        output: Option<&SyncOutput>,
        summary: &AttemptFailureSummary,
    ) -> Result<()> {
        let stats = output_stats(output);
        let summary = summary.clone();
        self.call(move |b| {
            b.finish_attempt(job_id, attempt, AttemptStatus::Failed, stats.as_ref(), Some(&summary))?;
            b.update_job_status(job_id, JobStatus::Incomplete, None)
        })
        .await
    }

    async fn job_failure(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        _connection_id: ConnectionId,
        reason: &str,
    ) -> Result<()> {
        let reason = reason.to_string();
        self.call(move |b| {
            let running = b
                .get_attempt(job_id, attempt)?
                .is_some_and(|a| a.status == AttemptStatus::Running);
            if running {
                b.finish_attempt(job_id, attempt, AttemptStatus::Failed, None, None)?;
            }
            b.update_job_status(job_id, JobStatus::Failed, Some(&reason))
        })
        .await
    }

    async fn job_cancelled(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        _connection_id: ConnectionId,
        summary: &AttemptFailureSummary,
    ) -> Result<()> {
        let summary = summary.clone();
        self.call(move |b| {
            b.finish_attempt(job_id, attempt, AttemptStatus::Failed, None, Some(&summary))?;
            b.update_job_status(job_id, JobStatus::Cancelled, None)
        })
        .await
    }
}

#[async_trait]
impl ConnectionHealth for StateActivities {
    async fn check_run_progress(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        _connection_id: ConnectionId,
    ) -> Result<bool> {
        let record = self
            .call(move |b| b.get_attempt(job_id, attempt))
            .await?
            .ok_or_else(|| anyhow!("attempt {attempt} of job {job_id} does not exist"))?;
        Ok(record.stats.records_committed > 0)
    }

    async fn auto_disable_if_failing_too_much(&self, connection_id: ConnectionId) -> Result<bool> {
        let jobs = self.call(move |b| b.list_jobs(connection_id)).await?;
        if !should_auto_disable(&jobs, &self.auto_disable, (self.clock)()) {
            return Ok(false);
        }
        self.call(move |b| b.set_connection_status(connection_id, ConnectionStatus::Inactive))
            .await?;
        tracing::warn!(%connection_id, "Disabled connection that keeps failing");
        Ok(true)
    }
}

#[async_trait]
impl RetryStateStore for StateActivities {
    async fn hydrate_retry_state(
        &self,
        job_id: Option<JobId>,
        connection_id: ConnectionId,
    ) -> Result<Option<RetryManager>> {
        let Some(job_id) = job_id else {
            return Ok(Some(RetryManager::new(self.policy)));
        };
        let counters = self
            .call(move |b| b.get_retry_counters(connection_id, job_id))
            .await?
            .unwrap_or_default();
        Ok(Some(RetryManager::hydrate(self.policy, counters)))
    }

    async fn persist_retry_state(
        &self,
        job_id: JobId,
        connection_id: ConnectionId,
        manager: &RetryManager,
    ) -> Result<()> {
        let counters = manager.counters();
        self.call(move |b| b.put_retry_counters(connection_id, job_id, &counters))
            .await
    }
}

#[async_trait]
impl StreamResetTracker for StateActivities {
    async fn delete_stream_reset_records(&self, connection_id: ConnectionId, job_id: JobId) -> Result<()> {
        let job = self.job(job_id).await?;
        if job.kind != JobKind::Reset {
            return Ok(());
        }
        let deleted = self.call(move |b| b.delete_stream_resets(connection_id)).await?;
        tracing::info!(%connection_id, job_id, deleted, "Cleared stream reset records");
        Ok(())
    }
}

#[async_trait]
impl AttemptLog for StateActivities {
    async fn append_attempt_log(
        &self,
        job_id: JobId,
        attempt: AttemptNumber,
        message: &str,
        level: LogLevel,
    ) -> Result<bool> {
        let message = message.to_string();
        self.call(move |b| b.append_attempt_log(job_id, attempt, level.as_str(), &message))
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl RunRequestStore for StateActivities {
    async fn save_run_request(&self, request: &RunRequest) -> Result<()> {
        let connection_id = request.connection_id;
        let payload = serde_json::to_string(request).context("serialize run request")?;
        self.call(move |b| b.save_run_request(connection_id, &payload)).await
    }

    async fn load_run_request(&self, connection_id: ConnectionId) -> Result<Option<RunRequest>> {
        let Some(payload) = self.call(move |b| b.load_run_request(connection_id)).await? else {
            return Ok(None);
        };
        let request = serde_json::from_str(&payload)
            .with_context(|| format!("corrupt run request for connection {connection_id}"))?;
        Ok(Some(request))
    }
}
