//! Connection orchestrator: the durable per-connection control loop.
//!
//! Each iteration waits for the schedule (or a signal), runs one attempt of
//! a job (connection checks, then the sync), records the outcome and hands
//! the next iteration a [`RunRequest`]. Failures of mandatory collaborator
//! calls restart the loop after a delay; best-effort calls fall back to a
//! default.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures_util::FutureExt;
use syncpilot_types::{
    ActorId, ActorType, AttemptNumber, CheckOutput, ConnectionContext, ConnectionId, FailureCause,
    FailureOrigin, FailureReason, FailureType, JobId, JobStatus, MetricKind, SyncOutput,
    WorkflowMetric,
};
use tokio_util::sync::CancellationToken;

use crate::activities::{Activities, CheckRequest, LogLevel, SyncRequest};
use crate::check::SyncCheckConnectionResult;
use crate::errors::{describe_failure, ChildOperationError, Exit, Step};
use crate::failure::{
    activity_failure, failure_summary, failure_summary_for_cancellation, platform_failure,
    unknown_origin_failure,
};
use crate::handle::{ConnectionHandle, Shared};
use crate::request::{InternalState, JobInformation, RunRequest, NON_RUNNING_ATTEMPT_ID};
use crate::retry::{format_duration, RetryManager};
use crate::workflow_state::WorkflowState;

/// Delay before restarting after a failed mandatory call, when the delay
/// itself cannot be fetched.
pub const DEFAULT_WORKFLOW_DELAY: Duration = Duration::from_secs(600);

/// Switches for the optional steps at the top of an iteration.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Stop for good when the connection's workspace is tombstoned.
    pub check_workspace_tombstone: bool,
    /// Hold off while the platform asks this connection to back off.
    pub load_shed_backoff: bool,
    pub default_workflow_delay: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            check_workspace_tombstone: true,
            load_shed_backoff: true,
            default_workflow_delay: DEFAULT_WORKFLOW_DELAY,
        }
    }
}

/// How an iteration ended.
#[derive(Debug)]
pub enum Iteration {
    /// Start another iteration with this request.
    Continue(RunRequest),
    /// The connection is gone.
    Stop,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

async fn mandatory<T>(
    operation: &'static str,
    call: impl Future<Output = anyhow::Result<T>>,
) -> Step<T> {
    call.await.map_err(|error| Exit::ActivityFailed { operation, error })
}

/// Drives one connection.
pub struct ConnectionOrchestrator {
    connection_id: ConnectionId,
    activities: Activities,
    options: OrchestratorOptions,
    shared: Arc<Shared>,
    context: Option<ConnectionContext>,
    workflow_delay: Duration,
    retry_manager: Option<RetryManager>,
    internal: InternalState,
}

impl ConnectionOrchestrator {
    /// Build an orchestrator and the handle used to signal it.
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        activities: Activities,
        options: OrchestratorOptions,
    ) -> (Self, ConnectionHandle) {
        let shared = Arc::new(Shared::new(WorkflowState::default()));
        let handle = ConnectionHandle::new(connection_id, shared.clone());
        let workflow_delay = options.default_workflow_delay;
        let orchestrator = Self {
            connection_id,
            activities,
            options,
            shared,
            context: None,
            workflow_delay,
            retry_manager: None,
            internal: InternalState::default(),
        };
        (orchestrator, handle)
    }

    /// Run iterations until the connection stops.
    pub async fn run(mut self, request: RunRequest) {
        let mut request = request;
        loop {
            match self.run_iteration(request).await {
                Iteration::Continue(next) => {
                    self.best_effort(
                        "save_run_request",
                        self.activities.run_requests.save_run_request(&next),
                        (),
                    )
                    .await;
                    request = next;
                }
                Iteration::Stop => {
                    tracing::info!(connection_id = %self.connection_id, "Connection loop stopped");
                    return;
                }
            }
        }
    }

    /// Run a single iteration.
    ///
    /// A panic inside the iteration is handled like any other unexpected
    /// failure: the attempt is failed and the loop goes on.
    pub async fn run_iteration(&mut self, request: RunRequest) -> Iteration {
        let mut request = request;
        self.begin_iteration(&mut request);

        let outcome = AssertUnwindSafe(self.run_top_level(&mut request))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                self.shared.close_scope();
                Err(Exit::Unexpected(anyhow!(
                    "connection loop panicked: {}",
                    panic_message(&*payload)
                )))
            });
        let iteration = self.conclude(request, outcome).await;
        self.shared.set_job_information(JobInformation::non_running());
        iteration
    }

    async fn conclude(&mut self, request: RunRequest, outcome: Step<()>) -> Iteration {
        let mut request = request;
        match outcome {
            Ok(()) => Iteration::Continue(self.prepare_for_next_run(&mut request)),
            Err(Exit::ContinueAsNew(next)) => {
                if self.shared.with_state(|s| s.is_deleted()) {
                    tracing::info!(connection_id = %self.connection_id, "Connection deleted, not continuing");
                    return Iteration::Stop;
                }
                Iteration::Continue(next)
            }
            Err(Exit::Stop) => Iteration::Stop,
            Err(Exit::ActivityFailed { operation, error }) => {
                self.recover_from_activity_failure(operation, error).await
            }
            Err(Exit::Unexpected(error)) => self.recover_from_unexpected(request, error).await,
            Err(Exit::Child(error)) => self.recover_from_unexpected(request, error.into()).await,
            Err(Exit::Cancelled) => {
                let error = anyhow!("cancellation escaped its scope");
                self.recover_from_unexpected(request, error).await
            }
        }
    }

    fn begin_iteration(&mut self, request: &mut RunRequest) {
        self.connection_id = request.connection_id;
        self.context = None;
        self.retry_manager = None;
        self.workflow_delay = self.options.default_workflow_delay;
        self.internal = InternalState::from_request(request);

        let carried = request.workflow_state.take();
        let from_failure = request.from_failure;
        self.shared.with_state(|s| {
            if let Some(carried) = &carried {
                s.adopt_identity(carried);
            }
            if from_failure {
                s.set_running(true);
            }
        });
        self.publish_job_information();
    }

    async fn run_top_level(&mut self, request: &mut RunRequest) -> Step<()> {
        let connection_id = self.connection_id;

        if self.options.check_workspace_tombstone {
            let tombstoned = self
                .best_effort(
                    "is_workspace_tombstone",
                    self.activities.config.is_workspace_tombstone(connection_id),
                    false,
                )
                .await;
            if tombstoned {
                tracing::info!(%connection_id, "Workspace is tombstoned, stopping");
                return Err(Exit::Stop);
            }
        }

        let context = mandatory(
            "get_connection_context",
            self.activities.config.get_connection_context(connection_id),
        )
        .await?;
        self.context = Some(context.clone());

        if self.options.load_shed_backoff {
            self.wait_out_load_shedding(&context).await?;
        }

        self.workflow_delay = self
            .best_effort(
                "get_workflow_restart_delay",
                self.activities.config.get_workflow_restart_delay(),
                self.options.default_workflow_delay,
            )
            .await;

        self.record_metric(WorkflowMetric::new(MetricKind::WorkflowAttempt, connection_id))
            .await?;

        let token = self.shared.open_scope();
        let result = self.run_cancellable(request, &token).await;
        self.shared.close_scope();

        match result {
            Ok(()) => {}
            Err(Exit::Cancelled) => {
                tracing::info!(%connection_id, "Cancellation scope unwound");
                self.record_metric(
                    WorkflowMetric::new(MetricKind::WorkflowFailure, connection_id)
                        .with_job(self.internal.job_id, self.internal.attempt_number)
                        .with_cause(FailureCause::Canceled),
                )
                .await?;
            }
            Err(exit) => return Err(exit),
        }

        let (deleted, running, cancelled_for_reset, cancelled) = self.shared.with_state(|s| {
            (s.is_deleted(), s.is_running(), s.is_cancelled_for_reset(), s.is_cancelled())
        });
        if deleted {
            if running {
                self.report_cancelled().await?;
            }
            tracing::info!(%connection_id, "Connection deleted, stopping");
            return Err(Exit::Stop);
        }
        if cancelled_for_reset {
            return self.report_cancelled_and_continue(request, true).await;
        }
        if cancelled {
            return self.report_cancelled_and_continue(request, false).await;
        }
        Ok(())
    }

    async fn wait_out_load_shedding(&self, context: &ConnectionContext) -> Step<()> {
        loop {
            let backoff = mandatory(
                "get_load_shed_backoff",
                self.activities.config.get_load_shed_backoff(context),
            )
            .await?;
            if backoff.is_zero() {
                return Ok(());
            }
            tracing::info!(
                connection_id = %self.connection_id,
                backoff_secs = backoff.as_secs(),
                "Load shedding, backing off"
            );
            let deadline = tokio::time::Instant::now() + backoff;
            loop {
                let notified = self.shared.notified();
                if self.shared.with_state(|s| s.is_deleted()) {
                    return Err(Exit::Stop);
                }
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => break,
                    () = notified => {}
                }
            }
        }
    }

    /// Everything that runs inside the cancellation scope.
    async fn run_cancellable(&mut self, request: &mut RunRequest, token: &CancellationToken) -> Step<()> {
        let connection_id = self.connection_id;

        if request.skip_scheduling {
            self.shared.with_state(|s| s.set_skip_scheduling(true));
        }

        if request.job_id.is_none() {
            mandatory(
                "ensure_clean_job_state",
                self.activities.jobs.ensure_clean_job_state(connection_id),
            )
            .await?;
        }

        self.retry_manager = self.hydrate_retry_manager().await;
        if let Some(manager) = &self.retry_manager {
            self.append_attempt_log(format!("Retry State: {manager}"), LogLevel::Info)
                .await;
        }

        let time_to_schedule = mandatory(
            "get_time_to_wait",
            self.activities.config.get_time_to_wait(connection_id),
        )
        .await?;
        let wait = if request.from_failure {
            self.resolve_backoff().await
        } else {
            time_to_schedule
        };
        tracing::debug!(
            %connection_id,
            wait_secs = wait.as_secs(),
            from_failure = request.from_failure,
            "Waiting for next run"
        );
        self.wait_for_schedule(wait, token).await?;
        self.shared.with_state(|s| s.set_done_waiting(true));

        let (deleted, updated, cancelled) =
            self.shared.with_state(|s| (s.is_deleted(), s.is_updated(), s.is_cancelled()));
        if deleted {
            tracing::info!(%connection_id, "Connection deleted while waiting");
            return Ok(());
        }
        if updated {
            tracing::info!(%connection_id, "Connection updated, restarting with fresh configuration");
            return Err(Exit::ContinueAsNew(self.prepare_for_next_run(request)));
        }
        if cancelled {
            return self.report_cancelled_and_continue(request, false).await;
        }

        self.retry_manager = self.hydrate_retry_manager().await;

        let flags = mandatory(
            "get_feature_flags",
            self.activities.config.get_feature_flags(connection_id),
        )
        .await?;
        tracing::debug!(%connection_id, ?flags, "Feature flags");

        let job_id = self.get_or_create_job_id(request).await?;
        self.create_attempt(job_id).await?;
        self.report_job_starting(job_id).await?;

        match self.run_attempt(request, token).await {
            Err(Exit::Child(error)) => self.handle_child_failure(request, error).await,
            other => other,
        }
    }

    /// Sleep for `duration` unless a signal interrupts it first.
    async fn wait_for_schedule(&self, duration: Duration, token: &CancellationToken) -> Step<()> {
        let deadline = tokio::time::Instant::now() + duration;
        loop {
            // Registered before the check so a signal in between still wakes us.
            let notified = self.shared.notified();
            if self.shared.with_state(|s| s.should_interrupt_wait()) {
                return Ok(());
            }
            if duration.is_zero() {
                return Ok(());
            }
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Ok(()),
                () = token.cancelled() => return Err(Exit::Cancelled),
                () = notified => {}
            }
        }
    }

    async fn get_or_create_job_id(&mut self, request: &mut RunRequest) -> Step<JobId> {
        let job_id = if let Some(job_id) = request.job_id {
            job_id
        } else {
            let scheduled = !self.shared.with_state(|s| s.is_skip_scheduling());
            let job_id = mandatory(
                "create_new_job",
                self.activities.jobs.create_new_job(self.connection_id, scheduled),
            )
            .await?;
            tracing::info!(connection_id = %self.connection_id, job_id, scheduled, "Created job");
            request.job_id = Some(job_id);
            job_id
        };
        self.internal.job_id = Some(job_id);
        self.publish_job_information();
        Ok(job_id)
    }

    async fn create_attempt(&mut self, job_id: JobId) -> Step<AttemptNumber> {
        let attempt = mandatory(
            "create_new_attempt_number",
            self.activities.jobs.create_new_attempt_number(job_id),
        )
        .await?;
        self.internal.attempt_number = Some(attempt);
        self.publish_job_information();
        tracing::info!(connection_id = %self.connection_id, job_id, attempt, "Created attempt");
        Ok(attempt)
    }

    async fn report_job_starting(&mut self, job_id: JobId) -> Step<()> {
        mandatory(
            "report_job_start",
            self.activities.jobs.report_job_start(job_id, self.connection_id),
        )
        .await?;
        self.shared.with_state(|s| s.set_running(true));
        Ok(())
    }

    /// Checks, then the sync, then the outcome report.
    async fn run_attempt(&mut self, request: &mut RunRequest, token: &CancellationToken) -> Step<()> {
        let context = self
            .context
            .clone()
            .ok_or_else(|| Exit::Unexpected(anyhow!("connection context missing")))?;
        let (job_id, attempt) = self.current_job()?;

        let check = self
            .check_connections(&context, job_id, attempt, request.reset_connection, token)
            .await?;

        if check.is_failed() {
            tracing::info!(
                connection_id = %self.connection_id,
                job_id,
                origin = ?check.failure_origin(),
                "Connection check failed"
            );
            let output = check.build_failure_output()?;
            self.absorb_failed_output(&output);
            self.report_failure(request, Some(&output), FailureCause::Connection, None)
                .await?;
            return Err(Exit::ContinueAsNew(self.prepare_for_next_run(request)));
        }

        if token.is_cancelled() {
            return Err(Exit::Cancelled);
        }
        let sync = SyncRequest {
            connection_id: self.connection_id,
            job_id,
            attempt,
            source_id: context.source_id,
            destination_id: context.destination_id,
        };
        let output = self
            .activities
            .connectors
            .run_sync(sync, token.child_token())
            .await?;

        if output.is_cancelled() {
            tracing::info!(connection_id = %self.connection_id, job_id, "Sync was cancelled");
            return self.report_cancelled_and_continue(request, false).await;
        }
        if self.absorb_failed_output(&output) {
            self.report_failure(request, Some(&output), FailureCause::Unknown, None)
                .await?;
        } else {
            self.report_success(request, &output).await?;
        }
        Err(Exit::ContinueAsNew(self.prepare_for_next_run(request)))
    }

    /// Record the failures of a failed output. Returns whether it failed.
    fn absorb_failed_output(&mut self, output: &SyncOutput) -> bool {
        if !output.is_failed() {
            return false;
        }
        self.internal.add_failures(output.failures.iter().cloned());
        self.internal.partial_success = Some(output.records_committed() > 0);
        true
    }

    async fn check_connections(
        &self,
        context: &ConnectionContext,
        job_id: JobId,
        attempt: AttemptNumber,
        reset_requested: bool,
        token: &CancellationToken,
    ) -> Step<SyncCheckConnectionResult> {
        let mut result = SyncCheckConnectionResult::new(job_id, attempt);

        let previous_failed = mandatory(
            "is_last_job_or_attempt_failure",
            self.activities
                .jobs
                .is_last_job_or_attempt_failure(job_id, attempt, self.connection_id),
        )
        .await?;
        if !previous_failed {
            tracing::debug!(connection_id = %self.connection_id, job_id, "Previous run succeeded, skipping checks");
            return Ok(result);
        }

        // A job turns into a reset when stream resets were pending at creation,
        // whether or not the request asked for one.
        let is_reset = reset_requested
            || mandatory("is_reset_job", self.activities.jobs.is_reset_job(job_id)).await?;
        if is_reset {
            tracing::debug!(connection_id = %self.connection_id, job_id, "Reset job, skipping source check");
        } else {
            let output = self
                .run_check(context.source_id, ActorType::Source, job_id, attempt, token)
                .await?;
            if output.is_failed() {
                result.set_failure(FailureOrigin::Source, output);
                return Ok(result);
            }
        }

        let output = self
            .run_check(context.destination_id, ActorType::Destination, job_id, attempt, token)
            .await?;
        if output.is_failed() {
            result.set_failure(FailureOrigin::Destination, output);
        }
        Ok(result)
    }

    async fn run_check(
        &self,
        actor_id: ActorId,
        actor_type: ActorType,
        job_id: JobId,
        attempt: AttemptNumber,
        token: &CancellationToken,
    ) -> Step<CheckOutput> {
        if token.is_cancelled() {
            return Err(Exit::Cancelled);
        }
        let request = CheckRequest {
            connection_id: self.connection_id,
            actor_id,
            actor_type,
            job_id,
            attempt,
        };
        Ok(self
            .activities
            .connectors
            .run_check(request, token.child_token())
            .await?)
    }

    async fn handle_child_failure(
        &mut self,
        request: &mut RunRequest,
        error: ChildOperationError,
    ) -> Step<()> {
        let requested = self
            .shared
            .with_state(|s| s.is_cancelled() || s.is_cancelled_for_reset() || s.is_deleted());
        let (job_id, attempt) = (self.internal.job_id, self.internal.attempt_number);

        let (reason, cause) = match error {
            ChildOperationError::Cancelled if requested => {
                tracing::info!(connection_id = %self.connection_id, "Child operation cancelled");
                return Ok(());
            }
            ChildOperationError::Cancelled => (
                unknown_origin_failure(
                    &anyhow!("child operation cancelled without a cancellation request"),
                    job_id,
                    attempt,
                ),
                FailureCause::Workflow,
            ),
            ChildOperationError::Activity { operation, source } => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    operation = %operation,
                    error = %source,
                    "Child operation activity failed"
                );
                (activity_failure(&operation, &source, job_id, attempt), FailureCause::Activity)
            }
            ChildOperationError::Other(error) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    error = %error,
                    "Child operation failed"
                );
                (unknown_origin_failure(&error, job_id, attempt), FailureCause::Workflow)
            }
        };

        self.internal.add_failures([reason]);
        self.report_failure(request, None, cause, None).await?;
        Err(Exit::ContinueAsNew(self.prepare_for_next_run(request)))
    }

    /// Record a failed attempt, then either schedule a retry or fail the job.
    async fn report_failure(
        &mut self,
        request: &mut RunRequest,
        output: Option<&SyncOutput>,
        cause: FailureCause,
        override_reasons: Option<Vec<FailureReason>>,
    ) -> Step<()> {
        let connection_id = self.connection_id;
        let (job_id, attempt) = self.current_job()?;
        let reasons = override_reasons.unwrap_or_else(|| self.internal.failures().to_vec());
        let summary = failure_summary(&reasons, self.internal.partial_success);

        mandatory(
            "attempt_failure",
            self.activities
                .jobs
                .attempt_failure(job_id, attempt, connection_id, output, &summary),
        )
        .await?;
        self.shared.with_state(|s| s.set_failed(true));

        let made_progress = self
            .best_effort(
                "check_run_progress",
                self.activities.health.check_run_progress(job_id, attempt, connection_id),
                false,
            )
            .await;
        self.accumulate_failure(job_id, made_progress).await;

        let first_reason = output
            .and_then(|o| o.failures.first())
            .or_else(|| reasons.first());
        let config_error = first_reason.and_then(|r| r.failure_type) == Some(FailureType::ConfigError);

        if !config_error && self.within_retry_limit(request.attempt_number).await? {
            request.attempt_number += 1;
            request.from_failure = true;
            tracing::warn!(
                %connection_id,
                job_id,
                attempt,
                next_attempt = request.attempt_number,
                made_progress,
                "Attempt failed, will retry"
            );
            if made_progress {
                self.best_effort_metric(
                    WorkflowMetric::new(MetricKind::AttemptMadeProgress, connection_id)
                        .with_job(Some(job_id), Some(attempt))
                        .with_attribute("will_retry", true),
                )
                .await;
            }
            return Ok(());
        }

        let message = match first_reason {
            Some(reason) if config_error => reason
                .internal_message
                .clone()
                .unwrap_or_else(|| "Connection check failed".to_string()),
            _ => format!("Job failed after too many retries for connection {connection_id}"),
        };
        tracing::error!(%connection_id, job_id, attempt, config_error, reason = %message, "Failing job");
        self.fail_job(job_id, attempt, &message).await?;

        self.record_metric(
            WorkflowMetric::new(MetricKind::WorkflowFailure, connection_id)
                .with_job(Some(job_id), Some(attempt))
                .with_cause(cause)
                .with_attribute("made_progress", made_progress),
        )
        .await?;
        if made_progress {
            self.best_effort_metric(
                WorkflowMetric::new(MetricKind::AttemptMadeProgress, connection_id)
                    .with_job(Some(job_id), Some(attempt))
                    .with_attribute("will_retry", false),
            )
            .await;
        }
        request.reset_to_defaults();
        Ok(())
    }

    async fn accumulate_failure(&mut self, job_id: JobId, made_progress: bool) {
        let Some(manager) = self.retry_manager.as_mut() else {
            return;
        };
        manager.increment_failure(made_progress);
        let snapshot = manager.clone();
        self.best_effort(
            "persist_retry_state",
            self.activities
                .retry_state
                .persist_retry_state(job_id, self.connection_id, &snapshot),
            (),
        )
        .await;
        self.append_attempt_log(format!("Retry State: {snapshot}"), LogLevel::Info)
            .await;
    }

    async fn within_retry_limit(&self, attempt_ordinal: u32) -> Step<bool> {
        if let Some(manager) = &self.retry_manager {
            return Ok(manager.should_retry());
        }
        let max_attempts =
            mandatory("get_max_attempts", self.activities.config.get_max_attempts()).await?;
        Ok(max_attempts > attempt_ordinal)
    }

    async fn fail_job(&self, job_id: JobId, attempt: AttemptNumber, reason: &str) -> Step<()> {
        let connection_id = self.connection_id;
        self.append_attempt_log(format!("Failing job: {job_id}, reason: {reason}"), LogLevel::Info)
            .await;
        mandatory(
            "job_failure",
            self.activities.jobs.job_failure(job_id, attempt, connection_id, reason),
        )
        .await?;
        self.run_end_of_sync_hooks(JobStatus::Failed).await?;

        let disabled = mandatory(
            "auto_disable_if_failing_too_much",
            self.activities.health.auto_disable_if_failing_too_much(connection_id),
        )
        .await?;
        if disabled {
            self.append_attempt_log(
                format!("Auto-disabled for constantly failing for connection {connection_id}"),
                LogLevel::Info,
            )
            .await;
            tracing::info!(%connection_id, "Connection auto-disabled after repeated failures");
        }
        Ok(())
    }

    async fn report_success(&mut self, request: &mut RunRequest, output: &SyncOutput) -> Step<()> {
        let connection_id = self.connection_id;
        let (job_id, attempt) = self.current_job()?;
        self.shared.with_state(|s| s.set_success(true));

        mandatory(
            "job_success",
            self.activities.jobs.job_success(job_id, attempt, connection_id, output),
        )
        .await?;
        self.run_end_of_sync_hooks(JobStatus::Succeeded).await?;
        mandatory(
            "delete_stream_reset_records",
            self.activities
                .stream_resets
                .delete_stream_reset_records(connection_id, job_id),
        )
        .await?;
        self.record_metric(
            WorkflowMetric::new(MetricKind::WorkflowSuccess, connection_id)
                .with_job(Some(job_id), Some(attempt)),
        )
        .await?;

        tracing::info!(
            %connection_id,
            job_id,
            attempt,
            records_committed = output.records_committed(),
            "Job succeeded"
        );
        request.reset_to_defaults();
        Ok(())
    }

    /// Mark the current job cancelled. No-op without a job and attempt.
    async fn report_cancelled(&self) -> Step<()> {
        let (Some(job_id), Some(attempt)) = (self.internal.job_id, self.internal.attempt_number)
        else {
            return Ok(());
        };
        let summary = failure_summary_for_cancellation(
            job_id,
            attempt,
            self.internal.failures(),
            self.internal.partial_success,
        );
        mandatory(
            "job_cancelled",
            self.activities
                .jobs
                .job_cancelled(job_id, attempt, self.connection_id, &summary),
        )
        .await?;
        self.run_end_of_sync_hooks(JobStatus::Cancelled).await?;
        self.shared.with_state(|s| s.set_cancelled(true));
        tracing::info!(connection_id = %self.connection_id, job_id, attempt, "Job cancelled");
        Ok(())
    }

    /// Report the cancellation and continue; `skip_next` asks the next
    /// iteration to run a reset right away.
    async fn report_cancelled_and_continue(
        &mut self,
        request: &mut RunRequest,
        skip_next: bool,
    ) -> Step<()> {
        self.report_cancelled().await?;
        request.reset_to_defaults();
        request.skip_scheduling = skip_next;
        request.reset_connection = skip_next;
        Err(Exit::ContinueAsNew(self.prepare_for_next_run(request)))
    }

    async fn run_end_of_sync_hooks(&self, status: JobStatus) -> Step<()> {
        let Some(job_id) = self.internal.job_id else {
            return Ok(());
        };
        mandatory(
            "start_post_processing",
            self.activities
                .post_processing
                .start_post_processing(job_id, self.connection_id, status),
        )
        .await?;
        tracing::debug!(connection_id = %self.connection_id, job_id, status = %status.as_str(), "Post-processing started");
        Ok(())
    }

    /// Build the request of the next iteration and clear per-iteration state.
    fn prepare_for_next_run(&mut self, request: &mut RunRequest) -> RunRequest {
        self.internal.clear_failures();
        let skip_next = self.shared.with_state(|s| {
            let skip_next = s.is_skip_scheduling_next_workflow();
            s.reset();
            skip_next
        });
        if skip_next {
            request.skip_scheduling = true;
        }
        let mut next = request.clone();
        next.workflow_state = None;
        next
    }

    async fn recover_from_activity_failure(
        &mut self,
        operation: &'static str,
        error: anyhow::Error,
    ) -> Iteration {
        let connection_id = self.connection_id;
        tracing::error!(
            %connection_id,
            operation,
            "{}",
            describe_failure(connection_id, operation, &error)
        );
        tokio::time::sleep(self.workflow_delay).await;

        if let (Some(job_id), Some(attempt)) = (self.internal.job_id, self.internal.attempt_number) {
            let mut request = RunRequest::new(connection_id);
            request.job_id = Some(job_id);
            request.attempt_number = attempt + 1;
            let reason = platform_failure(&error, Some(job_id), Some(attempt));
            match self
                .report_failure(&mut request, None, FailureCause::Activity, Some(vec![reason]))
                .await
            {
                Ok(()) => {}
                Err(Exit::ActivityFailed { operation, error }) => {
                    tracing::error!(
                        %connection_id,
                        operation,
                        "{}",
                        describe_failure(connection_id, operation, &error)
                    );
                    tokio::time::sleep(self.workflow_delay).await;
                }
                Err(exit) => {
                    tracing::warn!(%connection_id, ?exit, "Could not report the activity failure");
                }
            }
        } else {
            tracing::warn!(%connection_id, "No job or attempt to attribute the activity failure to");
        }

        self.shared.with_state(WorkflowState::reset);
        Iteration::Continue(RunRequest::new(connection_id))
    }

    async fn recover_from_unexpected(&mut self, request: RunRequest, error: anyhow::Error) -> Iteration {
        let connection_id = self.connection_id;
        let mut request = request;
        tracing::error!(%connection_id, error = %format!("{error:#}"), "Unexpected failure in connection loop");

        if let (Some(job_id), Some(attempt)) = (self.internal.job_id, self.internal.attempt_number) {
            self.internal
                .add_failures([unknown_origin_failure(&error, Some(job_id), Some(attempt))]);
            if let Err(exit) = self
                .report_failure(&mut request, None, FailureCause::Unknown, None)
                .await
            {
                tracing::warn!(%connection_id, ?exit, "Could not report the unexpected failure");
            }
        }

        tokio::time::sleep(self.workflow_delay).await;
        Iteration::Continue(self.prepare_for_next_run(&mut request))
    }

    /// Backoff before retrying. Zero when retries are counted by attempts.
    async fn resolve_backoff(&self) -> Duration {
        let Some(manager) = &self.retry_manager else {
            return Duration::ZERO;
        };
        let backoff = manager.backoff();
        self.append_attempt_log(
            format!("Backing off for: {}.", format_duration(backoff)),
            LogLevel::Warn,
        )
        .await;
        backoff
    }

    async fn hydrate_retry_manager(&self) -> Option<RetryManager> {
        self.best_effort(
            "hydrate_retry_state",
            self.activities
                .retry_state
                .hydrate_retry_state(self.internal.job_id, self.connection_id),
            None,
        )
        .await
    }

    async fn append_attempt_log(&self, message: String, level: LogLevel) {
        let (Some(job_id), Some(attempt)) = (self.internal.job_id, self.internal.attempt_number) else {
            tracing::debug!(connection_id = %self.connection_id, log_line = %message, "No attempt to log to");
            return;
        };
        self.best_effort(
            "append_attempt_log",
            self.activities
                .attempt_log
                .append_attempt_log(job_id, attempt, &message, level),
            false,
        )
        .await;
    }

    async fn record_metric(&self, metric: WorkflowMetric) -> Step<()> {
        mandatory(
            "record_workflow_metric",
            self.activities.metrics.record_workflow_metric(metric),
        )
        .await
    }

    async fn best_effort_metric(&self, metric: WorkflowMetric) {
        self.best_effort(
            "record_workflow_metric",
            self.activities.metrics.record_workflow_metric(metric),
            (),
        )
        .await;
    }

    /// Await `call`; on failure log, meter and return `default`.
    async fn best_effort<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = anyhow::Result<T>>,
        default: T,
    ) -> T {
        match call.await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    operation,
                    error = %format!("{error:#}"),
                    "Best-effort activity failed, using default"
                );
                let metric = WorkflowMetric::new(MetricKind::ActivityFailure, self.connection_id)
                    .with_job(self.internal.job_id, self.internal.attempt_number)
                    .with_attribute("activity", operation);
                if let Err(e) = self.activities.metrics.record_workflow_metric(metric).await {
                    tracing::debug!(error = %e, "Could not record activity failure metric");
                }
                default
            }
        }
    }

    fn current_job(&self) -> Step<(JobId, AttemptNumber)> {
        match (self.internal.job_id, self.internal.attempt_number) {
            (Some(job_id), Some(attempt)) => Ok((job_id, attempt)),
            _ => Err(Exit::Unexpected(anyhow!(
                "no job and attempt for connection {}",
                self.connection_id
            ))),
        }
    }

    fn publish_job_information(&self) {
        let info = match self.internal.job_id {
            Some(job_id) => JobInformation {
                job_id,
                attempt_number: self
                    .internal
                    .attempt_number
                    .map_or(NON_RUNNING_ATTEMPT_ID, i64::from),
            },
            None => JobInformation::non_running(),
        };
        self.shared.set_job_information(info);
    }
}
