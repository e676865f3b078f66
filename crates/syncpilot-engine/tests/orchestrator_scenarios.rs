//! End-to-end iterations of the connection loop against recording fakes.
//!
//! Every collaborator is one [`Fake`] that records the operations it was
//! asked to perform. Time is paused, so backoffs and restart delays elapse
//! instantly.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use syncpilot_engine::activities::{
    Activities, AttemptLog, CheckRequest, ConfigFetch, ConnectionHealth, ConnectorRunner, JobTracker,
    LogLevel, MetricsSink, PostProcessor, RetryStateStore, RunRequestStore, StreamResetTracker,
    SyncRequest,
};
use syncpilot_engine::workflow_state::{ChangedStateEvent, StateChangedListener, StateField};
use syncpilot_engine::{
    ChildOperationError, ConnectionHandle, ConnectionOrchestrator, Iteration, JobInformation,
    OrchestratorOptions, RetryManager, RetryPolicy, RunRequest, WorkflowState,
};
use syncpilot_types::{
    ActorId, ActorType, AttemptFailureSummary, AttemptNumber, CheckOutput, ConnectionContext,
    ConnectionId, FailureCause, FailureOrigin, FailureReason, FailureType, JobId, JobStatus,
    MetricKind, ReplicationStatus, RetryCounters, SyncOutput, SyncStats, SyncSummary, WorkflowMetric,
    WorkspaceId,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const JOB_ID: JobId = 1;

#[derive(Clone)]
enum SyncBehaviour {
    Output(SyncOutput),
    WaitForCancel,
    ActivityError,
    Panic,
}

struct Fake {
    context: ConnectionContext,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
    tombstoned: AtomicBool,
    load_shed: Mutex<VecDeque<Duration>>,
    time_to_wait: Mutex<Duration>,
    previous_failed: AtomicBool,
    reset_job: AtomicBool,
    source_check: Mutex<CheckOutput>,
    destination_check: Mutex<CheckOutput>,
    sync: Mutex<SyncBehaviour>,
    made_progress: AtomicBool,
    retry: Mutex<Option<RetryManager>>,
    next_attempt: Mutex<AttemptNumber>,
    job_failures: Mutex<Vec<String>>,
    summaries: Mutex<Vec<AttemptFailureSummary>>,
    post_processed: Mutex<Vec<JobStatus>>,
    metrics: Mutex<Vec<WorkflowMetric>>,
    log_lines: Mutex<Vec<String>>,
    sync_started: Notify,
}

impl Fake {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            context: ConnectionContext {
                connection_id: ConnectionId::random(),
                workspace_id: WorkspaceId::random(),
                organization_id: None,
                source_id: ActorId::random(),
                destination_id: ActorId::random(),
            },
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            tombstoned: AtomicBool::new(false),
            load_shed: Mutex::new(VecDeque::new()),
            time_to_wait: Mutex::new(Duration::ZERO),
            previous_failed: AtomicBool::new(false),
            reset_job: AtomicBool::new(false),
            source_check: Mutex::new(CheckOutput::succeeded()),
            destination_check: Mutex::new(CheckOutput::succeeded()),
            sync: Mutex::new(SyncBehaviour::Output(completed(100))),
            made_progress: AtomicBool::new(false),
            retry: Mutex::new(None),
            next_attempt: Mutex::new(0),
            job_failures: Mutex::new(Vec::new()),
            summaries: Mutex::new(Vec::new()),
            post_processed: Mutex::new(Vec::new()),
            metrics: Mutex::new(Vec::new()),
            log_lines: Mutex::new(Vec::new()),
            sync_started: Notify::new(),
        })
    }

    fn connection_id(&self) -> ConnectionId {
        self.context.connection_id
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(operation.to_string());
        if self.failing.lock().unwrap().contains(operation) {
            bail!("{operation} is unavailable");
        }
        Ok(())
    }

    fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    fn count(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == operation).count()
    }

    fn metric_kinds(&self) -> Vec<(MetricKind, Option<FailureCause>)> {
        self.metrics.lock().unwrap().iter().map(|m| (m.kind, m.cause)).collect()
    }

    fn activities(self: &Arc<Self>) -> Activities {
        Activities {
            config: self.clone(),
            jobs: self.clone(),
            health: self.clone(),
            retry_state: self.clone(),
            stream_resets: self.clone(),
            metrics: self.clone(),
            attempt_log: self.clone(),
            post_processing: self.clone(),
            connectors: self.clone(),
            run_requests: self.clone(),
        }
    }

    fn orchestrator(self: &Arc<Self>) -> (ConnectionOrchestrator, ConnectionHandle) {
        let options = OrchestratorOptions {
            default_workflow_delay: Duration::from_secs(60),
            ..OrchestratorOptions::default()
        };
        ConnectionOrchestrator::new(self.connection_id(), self.activities(), options)
    }
}

#[async_trait]
impl ConfigFetch for Fake {
    async fn is_workspace_tombstone(&self, _: ConnectionId) -> Result<bool> {
        self.record("is_workspace_tombstone")?;
        Ok(self.tombstoned.load(Ordering::SeqCst))
    }

    async fn get_connection_context(&self, _: ConnectionId) -> Result<ConnectionContext> {
        self.record("get_connection_context")?;
        Ok(self.context.clone())
    }

    async fn get_load_shed_backoff(&self, _: &ConnectionContext) -> Result<Duration> {
        self.record("get_load_shed_backoff")?;
        Ok(self.load_shed.lock().unwrap().pop_front().unwrap_or(Duration::ZERO))
    }

    async fn get_time_to_wait(&self, _: ConnectionId) -> Result<Duration> {
        self.record("get_time_to_wait")?;
        Ok(*self.time_to_wait.lock().unwrap())
    }

    async fn get_max_attempts(&self) -> Result<u32> {
        self.record("get_max_attempts")?;
        Ok(3)
    }

    async fn get_feature_flags(&self, _: ConnectionId) -> Result<BTreeMap<String, bool>> {
        self.record("get_feature_flags")?;
        Ok(BTreeMap::new())
    }

    async fn get_workflow_restart_delay(&self) -> Result<Duration> {
        self.record("get_workflow_restart_delay")?;
        Ok(Duration::from_secs(60))
    }
}

#[async_trait]
impl JobTracker for Fake {
    async fn ensure_clean_job_state(&self, _: ConnectionId) -> Result<()> {
        self.record("ensure_clean_job_state")
    }

    async fn create_new_job(&self, _: ConnectionId, _: bool) -> Result<JobId> {
        self.record("create_new_job")?;
        Ok(JOB_ID)
    }

    async fn create_new_attempt_number(&self, _: JobId) -> Result<AttemptNumber> {
        self.record("create_new_attempt_number")?;
        Ok(*self.next_attempt.lock().unwrap())
    }

    async fn report_job_start(&self, _: JobId, _: ConnectionId) -> Result<()> {
        self.record("report_job_start")
    }

    async fn is_reset_job(&self, _: JobId) -> Result<bool> {
        self.record("is_reset_job")?;
        Ok(self.reset_job.load(Ordering::SeqCst))
    }

    async fn is_last_job_or_attempt_failure(&self, _: JobId, _: AttemptNumber, _: ConnectionId) -> Result<bool> {
        self.record("is_last_job_or_attempt_failure")?;
        Ok(self.previous_failed.load(Ordering::SeqCst))
    }

    async fn job_success(&self, _: JobId, _: AttemptNumber, _: ConnectionId, _: &SyncOutput) -> Result<()> {
        self.record("job_success")
    }

    async fn attempt_failure(
        &self,
        _: JobId,
        _: AttemptNumber,
        _: ConnectionId,
        _: Option<&SyncOutput>,
        summary: &AttemptFailureSummary,
    ) -> Result<()> {
        self.record("attempt_failure")?;
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }

    async fn job_failure(&self, _: JobId, _: AttemptNumber, _: ConnectionId, reason: &str) -> Result<()> {
        self.record("job_failure")?;
        self.job_failures.lock().unwrap().push(reason.to_string());
        Ok(())
    }

    async fn job_cancelled(&self, _: JobId, _: AttemptNumber, _: ConnectionId, summary: &AttemptFailureSummary) -> Result<()> {
        self.record("job_cancelled")?;
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }
}

#[async_trait]
impl ConnectionHealth for Fake {
    async fn check_run_progress(&self, _: JobId, _: AttemptNumber, _: ConnectionId) -> Result<bool> {
        self.record("check_run_progress")?;
        Ok(self.made_progress.load(Ordering::SeqCst))
    }

    async fn auto_disable_if_failing_too_much(&self, _: ConnectionId) -> Result<bool> {
        self.record("auto_disable_if_failing_too_much")?;
        Ok(false)
    }
}

#[async_trait]
impl RetryStateStore for Fake {
    async fn hydrate_retry_state(&self, _: Option<JobId>, _: ConnectionId) -> Result<Option<RetryManager>> {
        self.record("hydrate_retry_state")?;
        Ok(self.retry.lock().unwrap().clone())
    }

    async fn persist_retry_state(&self, _: JobId, _: ConnectionId, manager: &RetryManager) -> Result<()> {
        self.record("persist_retry_state")?;
        *self.retry.lock().unwrap() = Some(manager.clone());
        Ok(())
    }
}

#[async_trait]
impl StreamResetTracker for Fake {
    async fn delete_stream_reset_records(&self, _: ConnectionId, _: JobId) -> Result<()> {
        self.record("delete_stream_reset_records")
    }
}

#[async_trait]
impl MetricsSink for Fake {
    async fn record_workflow_metric(&self, metric: WorkflowMetric) -> Result<()> {
        self.record("record_workflow_metric")?;
        self.metrics.lock().unwrap().push(metric);
        Ok(())
    }
}

#[async_trait]
impl AttemptLog for Fake {
    async fn append_attempt_log(&self, _: JobId, _: AttemptNumber, message: &str, _: LogLevel) -> Result<bool> {
        self.record("append_attempt_log")?;
        self.log_lines.lock().unwrap().push(message.to_string());
        Ok(true)
    }
}

#[async_trait]
impl PostProcessor for Fake {
    async fn start_post_processing(&self, _: JobId, _: ConnectionId, status: JobStatus) -> Result<()> {
        self.record("start_post_processing")?;
        self.post_processed.lock().unwrap().push(status);
        Ok(())
    }
}

#[async_trait]
impl ConnectorRunner for Fake {
    async fn run_check(&self, request: CheckRequest, _: CancellationToken) -> Result<CheckOutput, ChildOperationError> {
        match request.actor_type {
            ActorType::Source => {
                self.calls.lock().unwrap().push("check_source".into());
                Ok(self.source_check.lock().unwrap().clone())
            }
            ActorType::Destination => {
                self.calls.lock().unwrap().push("check_destination".into());
                Ok(self.destination_check.lock().unwrap().clone())
            }
        }
    }

    async fn run_sync(&self, _: SyncRequest, cancel: CancellationToken) -> Result<SyncOutput, ChildOperationError> {
        self.calls.lock().unwrap().push("sync".into());
        let behaviour = self.sync.lock().unwrap().clone();
        match behaviour {
            SyncBehaviour::Output(output) => Ok(output),
            SyncBehaviour::WaitForCancel => {
                self.sync_started.notify_one();
                cancel.cancelled().await;
                Err(ChildOperationError::Cancelled)
            }
            SyncBehaviour::ActivityError => Err(ChildOperationError::activity(
                "sync",
                anyhow::anyhow!("worker lost"),
            )),
            SyncBehaviour::Panic => panic!("connector crashed"),
        }
    }
}

#[async_trait]
impl RunRequestStore for Fake {
    async fn save_run_request(&self, _: &RunRequest) -> Result<()> {
        self.record("save_run_request")
    }

    async fn load_run_request(&self, _: ConnectionId) -> Result<Option<RunRequest>> {
        self.record("load_run_request")?;
        Ok(None)
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<ChangedStateEvent>>,
}

impl StateChangedListener for RecordingListener {
    fn state_changed(&self, _: Uuid, event: ChangedStateEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingListener {
    /// Outcome flags that were ever set to true.
    fn outcomes_set(&self) -> Vec<StateField> {
        let mut set: Vec<StateField> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.value)
            .map(|e| e.field)
            .filter(|f| matches!(f, StateField::Success | StateField::Failed | StateField::Cancelled))
            .collect();
        set.dedup();
        set
    }
}

fn completed(records: u64) -> SyncOutput {
    SyncOutput {
        summary: Some(SyncSummary::new(ReplicationStatus::Completed).with_stats(SyncStats {
            records_committed: records,
            ..SyncStats::default()
        })),
        failures: Vec::new(),
    }
}

fn failed(records: u64, reason: FailureReason) -> SyncOutput {
    SyncOutput {
        summary: Some(SyncSummary::new(ReplicationStatus::Failed).with_stats(SyncStats {
            records_committed: records,
            ..SyncStats::default()
        })),
        failures: vec![reason],
    }
}

fn with_listener(mut request: RunRequest, listener: &Arc<RecordingListener>) -> RunRequest {
    let listener: Arc<dyn StateChangedListener> = listener.clone();
    request.workflow_state = Some(WorkflowState::new(Uuid::new_v4(), Some(listener)));
    request
}

fn expect_continue(iteration: Iteration) -> RunRequest {
    match iteration {
        Iteration::Continue(next) => next,
        Iteration::Stop => panic!("expected the loop to continue"),
    }
}

fn retrying_job(fake: &Fake, type_: FailureType) -> RunRequest {
    *fake.next_attempt.lock().unwrap() = 1;
    fake.made_progress.store(true, Ordering::SeqCst);
    *fake.retry.lock().unwrap() = Some(RetryManager::hydrate(
        RetryPolicy::default(),
        RetryCounters { successive_complete_failures: 1, total_complete_failures: 1, ..RetryCounters::default() },
    ));
    *fake.sync.lock().unwrap() = SyncBehaviour::Output(failed(
        25,
        FailureReason::new(FailureOrigin::Source, 1)
            .with_type(type_)
            .with_internal_message("bad credentials"),
    ));

    let mut request = RunRequest::new(fake.connection_id());
    request.job_id = Some(5);
    request.attempt_number = 2;
    request.from_failure = true;
    request
}

/// A fresh connection that is due runs one successful job without checks.
#[tokio::test(start_paused = true)]
async fn test_fresh_connection_runs_successful_job() {
    let fake = Fake::new();
    let listener = Arc::new(RecordingListener::default());
    let (mut orchestrator, handle) = fake.orchestrator();

    let request = with_listener(RunRequest::new(fake.connection_id()), &listener);
    let next = expect_continue(orchestrator.run_iteration(request).await);

    assert_eq!(fake.count("create_new_job"), 1);
    assert_eq!(fake.count("create_new_attempt_number"), 1);
    assert_eq!(fake.count("check_source"), 0, "no prior failure, no checks");
    assert_eq!(fake.count("check_destination"), 0);
    assert_eq!(fake.count("job_success"), 1);
    assert_eq!(fake.count("delete_stream_reset_records"), 1);
    assert_eq!(*fake.post_processed.lock().unwrap(), vec![JobStatus::Succeeded]);
    assert!(fake.metric_kinds().contains(&(MetricKind::WorkflowSuccess, None)));

    assert_eq!(next.job_id, None);
    assert_eq!(next.attempt_number, 1);
    assert!(!next.from_failure);
    assert!(!next.skip_scheduling);
    assert_eq!(listener.outcomes_set(), vec![StateField::Success]);

    let state = handle.get_state();
    assert!(!state.running && !state.success, "state is cleared for the next iteration");
}

/// A failed attempt that made progress is retried without failing the job.
#[tokio::test(start_paused = true)]
async fn test_retryable_failure_schedules_next_attempt() {
    let fake = Fake::new();
    let listener = Arc::new(RecordingListener::default());
    let (mut orchestrator, _handle) = fake.orchestrator();

    let request = with_listener(retrying_job(&fake, FailureType::SystemError), &listener);
    let next = expect_continue(orchestrator.run_iteration(request).await);

    assert_eq!(fake.count("create_new_job"), 0, "resumed job is reused");
    assert_eq!(fake.count("attempt_failure"), 1);
    assert_eq!(fake.count("job_failure"), 0);
    assert_eq!(next.job_id, Some(5));
    assert_eq!(next.attempt_number, 3);
    assert!(next.from_failure);
    assert!(fake
        .log_lines
        .lock()
        .unwrap()
        .iter()
        .any(|line| line == "Backing off for: 10s."));

    let counters = fake.retry.lock().unwrap().as_ref().unwrap().counters();
    assert_eq!(counters.successive_partial_failures, 1);
    assert_eq!(counters.successive_complete_failures, 0);
    assert_eq!(listener.outcomes_set(), vec![StateField::Failed]);
    assert!(fake
        .metrics
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.kind == MetricKind::AttemptMadeProgress && m.attribute("will_retry") == Some("true")));
}

/// A configuration error fails the job outright whatever the counters say.
#[tokio::test(start_paused = true)]
async fn test_config_error_fails_job_outright() {
    for successive in [0, 1, 4] {
        let fake = Fake::new();
        let (mut orchestrator, _handle) = fake.orchestrator();
        let request = retrying_job(&fake, FailureType::ConfigError);
        *fake.retry.lock().unwrap() = Some(RetryManager::hydrate(
            RetryPolicy::default(),
            RetryCounters { successive_complete_failures: successive, ..RetryCounters::default() },
        ));

        let next = expect_continue(orchestrator.run_iteration(request).await);

        assert_eq!(*fake.job_failures.lock().unwrap(), vec!["bad credentials".to_string()]);
        assert_eq!(fake.count("auto_disable_if_failing_too_much"), 1);
        assert!(!next.from_failure, "config errors are never retried");
        assert_eq!(next.job_id, None);
        assert_eq!(next.attempt_number, 1);
        assert!(fake
            .metric_kinds()
            .contains(&(MetricKind::WorkflowFailure, Some(FailureCause::Unknown))));
    }
}

/// Without a retry manager the attempt cap decides.
#[tokio::test(start_paused = true)]
async fn test_max_attempts_caps_retries_without_manager() {
    let fake = Fake::new();
    let (mut orchestrator, _handle) = fake.orchestrator();
    *fake.sync.lock().unwrap() = SyncBehaviour::Output(failed(
        0,
        FailureReason::new(FailureOrigin::Replication, 1).with_type(FailureType::SystemError),
    ));

    let mut request = RunRequest::new(fake.connection_id());
    request.job_id = Some(JOB_ID);
    request.attempt_number = 3;
    request.from_failure = true;
    *fake.next_attempt.lock().unwrap() = 2;
    let next = expect_continue(orchestrator.run_iteration(request).await);

    assert_eq!(fake.count("get_max_attempts"), 1);
    assert_eq!(fake.count("job_failure"), 1);
    assert!(fake.job_failures.lock().unwrap()[0].starts_with("Job failed after too many retries"));
    assert!(!next.from_failure);
}

/// When the previous run succeeded, no check runs.
#[tokio::test(start_paused = true)]
async fn test_checks_skipped_after_success() {
    let fake = Fake::new();
    *fake.source_check.lock().unwrap() = CheckOutput::failed("would fail");
    let (mut orchestrator, _handle) = fake.orchestrator();

    expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert_eq!(fake.count("is_last_job_or_attempt_failure"), 1);
    assert_eq!(fake.count("check_source"), 0);
    assert_eq!(fake.count("check_destination"), 0);
    assert_eq!(fake.count("job_success"), 1);
}

/// A failed source check skips the destination check and the sync.
#[tokio::test(start_paused = true)]
async fn test_source_check_failure_short_circuits() {
    let fake = Fake::new();
    fake.previous_failed.store(true, Ordering::SeqCst);
    *fake.source_check.lock().unwrap() = CheckOutput::failed("password rejected");
    let (mut orchestrator, _handle) = fake.orchestrator();

    let next = expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert_eq!(fake.count("check_source"), 1);
    assert_eq!(fake.count("check_destination"), 0);
    assert_eq!(fake.count("sync"), 0);
    let summaries = fake.summaries.lock().unwrap();
    assert_eq!(summaries[0].failures[0].failure_origin, FailureOrigin::Source);
    assert_eq!(fake.count("job_failure"), 1, "check failures are config errors");
    assert!(fake
        .metric_kinds()
        .contains(&(MetricKind::WorkflowFailure, Some(FailureCause::Connection))));
    assert_eq!(next.job_id, None);
}

/// A reset job skips the source check but still checks the destination.
#[tokio::test(start_paused = true)]
async fn test_reset_skips_source_check() {
    let fake = Fake::new();
    fake.previous_failed.store(true, Ordering::SeqCst);
    let (mut orchestrator, _handle) = fake.orchestrator();

    let mut request = RunRequest::new(fake.connection_id());
    request.reset_connection = true;
    request.skip_scheduling = true;
    *fake.time_to_wait.lock().unwrap() = Duration::from_secs(3600);
    let next = expect_continue(orchestrator.run_iteration(request).await);

    assert_eq!(fake.count("is_reset_job"), 0, "the request already says reset");
    assert_eq!(fake.count("check_source"), 0);
    assert_eq!(fake.count("check_destination"), 1);
    assert_eq!(fake.count("sync"), 1);
    assert!(!next.reset_connection);
    assert!(!next.skip_scheduling);
}

/// A job the tracker created as a reset skips the source check even when
/// the request did not ask for one.
#[tokio::test(start_paused = true)]
async fn test_reset_job_from_tracker_skips_source_check() {
    let fake = Fake::new();
    fake.previous_failed.store(true, Ordering::SeqCst);
    fake.reset_job.store(true, Ordering::SeqCst);
    *fake.source_check.lock().unwrap() = CheckOutput::failed("would fail");
    *fake.time_to_wait.lock().unwrap() = Duration::from_secs(3600);
    let (mut orchestrator, handle) = fake.orchestrator();

    // Asked for while waiting, so the request itself is not a reset.
    handle.reset_connection();
    let request = RunRequest::new(fake.connection_id());
    assert!(!request.reset_connection);
    expect_continue(orchestrator.run_iteration(request).await);

    assert_eq!(fake.count("is_reset_job"), 1);
    assert_eq!(fake.count("check_source"), 0);
    assert_eq!(fake.count("check_destination"), 1);
    assert_eq!(fake.count("job_success"), 1);
}

/// A failing child activity is attributed to it and retried.
#[tokio::test(start_paused = true)]
async fn test_sync_activity_failure_is_retried() {
    let fake = Fake::new();
    *fake.sync.lock().unwrap() = SyncBehaviour::ActivityError;
    let (mut orchestrator, _handle) = fake.orchestrator();

    let next = expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    let summaries = fake.summaries.lock().unwrap();
    assert_eq!(summaries[0].failures[0].failure_origin, FailureOrigin::Replication);
    assert_eq!(fake.count("job_failure"), 0);
    assert_eq!(next.job_id, Some(JOB_ID));
    assert_eq!(next.attempt_number, 2);
    assert!(next.from_failure);
}

/// Cancelling a running job reports it cancelled and waits for the schedule again.
#[tokio::test(start_paused = true)]
async fn test_cancel_running_job() {
    let fake = Fake::new();
    *fake.sync.lock().unwrap() = SyncBehaviour::WaitForCancel;
    let listener = Arc::new(RecordingListener::default());
    let (mut orchestrator, handle) = fake.orchestrator();

    let request = with_listener(RunRequest::new(fake.connection_id()), &listener);
    let task = tokio::spawn(async move { orchestrator.run_iteration(request).await });
    fake.sync_started.notified().await;
    assert!(handle.get_state().running);
    assert_eq!(handle.get_job_information().job_id, JOB_ID);

    handle.cancel_job();
    let next = expect_continue(task.await.unwrap());

    assert_eq!(fake.count("job_cancelled"), 1);
    assert_eq!(*fake.post_processed.lock().unwrap(), vec![JobStatus::Cancelled]);
    assert_eq!(next.job_id, None);
    assert!(!next.skip_scheduling);
    assert_eq!(listener.outcomes_set(), vec![StateField::Cancelled]);
    assert!(!handle.get_job_information().is_running());
}

/// Resetting a running job cancels it and asks for an immediate reset run.
#[tokio::test(start_paused = true)]
async fn test_reset_running_job() {
    let fake = Fake::new();
    *fake.sync.lock().unwrap() = SyncBehaviour::WaitForCancel;
    let (mut orchestrator, handle) = fake.orchestrator();

    let request = RunRequest::new(fake.connection_id());
    let task = tokio::spawn(async move { orchestrator.run_iteration(request).await });
    fake.sync_started.notified().await;

    handle.reset_connection();
    let next = expect_continue(task.await.unwrap());

    assert_eq!(fake.count("job_cancelled"), 1);
    assert!(next.skip_scheduling);
    assert!(next.reset_connection);
    assert_eq!(next.job_id, None);
}

/// Deleting a running connection cancels its job and stops the loop.
#[tokio::test(start_paused = true)]
async fn test_delete_running_connection_stops() {
    let fake = Fake::new();
    *fake.sync.lock().unwrap() = SyncBehaviour::WaitForCancel;
    let (mut orchestrator, handle) = fake.orchestrator();

    let request = RunRequest::new(fake.connection_id());
    let task = tokio::spawn(async move { orchestrator.run_iteration(request).await });
    fake.sync_started.notified().await;

    handle.delete_connection();
    assert!(matches!(task.await.unwrap(), Iteration::Stop));
    assert_eq!(fake.count("job_cancelled"), 1);
}

/// A deleted connection stops without creating a job.
#[tokio::test(start_paused = true)]
async fn test_delete_while_waiting_stops() {
    let fake = Fake::new();
    *fake.time_to_wait.lock().unwrap() = Duration::from_secs(3600);
    let (mut orchestrator, handle) = fake.orchestrator();

    handle.delete_connection();
    let iteration = orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await;

    assert!(matches!(iteration, Iteration::Stop));
    assert_eq!(fake.count("create_new_job"), 0);
    assert_eq!(fake.count("job_cancelled"), 0);
}

/// An update ends the wait and restarts with the same request.
#[tokio::test(start_paused = true)]
async fn test_update_restarts_without_running() {
    let fake = Fake::new();
    *fake.time_to_wait.lock().unwrap() = Duration::from_secs(3600);
    let (mut orchestrator, handle) = fake.orchestrator();

    handle.connection_updated();
    let next = expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert_eq!(fake.count("create_new_job"), 0);
    assert_eq!(next.job_id, None);
    assert!(!handle.get_state().updated, "flags are cleared for the next iteration");
}

/// A manual sync skips the scheduled wait and creates an unscheduled job.
#[tokio::test(start_paused = true)]
async fn test_manual_sync_skips_wait() {
    let fake = Fake::new();
    *fake.time_to_wait.lock().unwrap() = Duration::from_secs(100 * 24 * 3600);
    let (mut orchestrator, handle) = fake.orchestrator();

    handle.submit_manual_sync();
    let start = tokio::time::Instant::now();
    expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert!(start.elapsed() < Duration::from_secs(3600));
    assert_eq!(fake.count("job_success"), 1);
}

/// A failed mandatory call before any job exists restarts from scratch.
#[tokio::test(start_paused = true)]
async fn test_mandatory_failure_before_job_restarts() {
    let fake = Fake::new();
    fake.fail("create_new_job");
    let (mut orchestrator, _handle) = fake.orchestrator();

    let start = tokio::time::Instant::now();
    let next = expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert!(start.elapsed() >= Duration::from_secs(60), "restart waits the workflow delay");
    assert_eq!(fake.count("attempt_failure"), 0);
    assert_eq!(next.job_id, None);
    assert_eq!(next.attempt_number, 1);
}

/// A failed mandatory call during an attempt is reported as a platform failure.
#[tokio::test(start_paused = true)]
async fn test_mandatory_failure_during_attempt_reports_platform_failure() {
    let fake = Fake::new();
    fake.fail("report_job_start");
    let (mut orchestrator, _handle) = fake.orchestrator();

    let next = expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert_eq!(fake.count("attempt_failure"), 1);
    let summaries = fake.summaries.lock().unwrap();
    assert_eq!(summaries[0].failures[0].failure_origin, FailureOrigin::Platform);
    assert_eq!(next.job_id, None, "the loop restarts from a fresh request");
}

/// A failed best-effort call falls back to its default and is metered.
#[tokio::test(start_paused = true)]
async fn test_best_effort_failure_is_metered() {
    let fake = Fake::new();
    fake.fail("is_workspace_tombstone");
    let (mut orchestrator, _handle) = fake.orchestrator();

    expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert_eq!(fake.count("job_success"), 1, "iteration carries on");
    assert!(fake.metrics.lock().unwrap().iter().any(|m| {
        m.kind == MetricKind::ActivityFailure && m.attribute("activity") == Some("is_workspace_tombstone")
    }));
}

/// The run loop persists every request it continues with.
#[tokio::test(start_paused = true)]
async fn test_run_saves_each_request_until_deleted() {
    let fake = Fake::new();
    *fake.time_to_wait.lock().unwrap() = Duration::from_secs(3600);
    let (orchestrator, handle) = fake.orchestrator();

    let task = tokio::spawn(orchestrator.run(RunRequest::new(fake.connection_id())));
    while fake.count("job_success") < 2 {
        tokio::time::sleep(Duration::from_secs(600)).await;
    }
    handle.delete_connection();
    task.await.unwrap();

    assert!(fake.count("save_run_request") >= 2);
    assert!(handle.get_state().deleted);
}

/// A tombstoned workspace stops the loop before any job exists.
#[tokio::test(start_paused = true)]
async fn test_tombstoned_workspace_stops_without_job() {
    let fake = Fake::new();
    fake.tombstoned.store(true, Ordering::SeqCst);
    let (mut orchestrator, handle) = fake.orchestrator();

    let iteration = orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await;

    assert!(matches!(iteration, Iteration::Stop));
    assert_eq!(fake.count("get_connection_context"), 0);
    assert_eq!(fake.count("create_new_job"), 0);
    assert!(fake.metrics.lock().unwrap().is_empty());
    assert_eq!(handle.get_job_information(), JobInformation::non_running());
}

/// Load shedding is re-read after every backoff until it clears.
#[tokio::test(start_paused = true)]
async fn test_load_shedding_rechecks_until_clear() {
    let fake = Fake::new();
    fake.load_shed
        .lock()
        .unwrap()
        .extend([Duration::from_secs(300), Duration::from_secs(300)]);
    let (mut orchestrator, _handle) = fake.orchestrator();

    let start = tokio::time::Instant::now();
    expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);

    assert!(start.elapsed() >= Duration::from_secs(600));
    assert_eq!(fake.count("get_load_shed_backoff"), 3);
    assert_eq!(fake.count("create_new_job"), 1);
    assert_eq!(fake.count("job_success"), 1);
}

/// Deleting a connection that is backing off stops it right away.
#[tokio::test(start_paused = true)]
async fn test_delete_during_load_shedding_stops() {
    let fake = Fake::new();
    fake.load_shed.lock().unwrap().push_back(Duration::from_secs(3600));
    let (mut orchestrator, handle) = fake.orchestrator();

    let request = RunRequest::new(fake.connection_id());
    let start = tokio::time::Instant::now();
    let task = tokio::spawn(async move { orchestrator.run_iteration(request).await });
    tokio::time::sleep(Duration::from_secs(60)).await;
    handle.delete_connection();

    assert!(matches!(task.await.unwrap(), Iteration::Stop));
    assert!(start.elapsed() < Duration::from_secs(3600));
    assert_eq!(fake.count("get_load_shed_backoff"), 1);
    assert_eq!(fake.count("create_new_job"), 0);
}

/// A panic inside an attempt fails the attempt and the job, then the loop
/// carries on after the restart delay.
#[tokio::test(start_paused = true)]
async fn test_panic_fails_attempt_and_continues() {
    let fake = Fake::new();
    *fake.sync.lock().unwrap() = SyncBehaviour::Panic;
    let listener = Arc::new(RecordingListener::default());
    let (mut orchestrator, handle) = fake.orchestrator();

    let mut request = RunRequest::new(fake.connection_id());
    request.job_id = Some(JOB_ID);
    request.attempt_number = 3;
    request.from_failure = true;
    *fake.next_attempt.lock().unwrap() = 2;
    let request = with_listener(request, &listener);

    let start = tokio::time::Instant::now();
    let next = expect_continue(orchestrator.run_iteration(request).await);

    assert!(start.elapsed() >= Duration::from_secs(60), "restart waits the workflow delay");
    assert_eq!(fake.count("attempt_failure"), 1);
    {
        let summaries = fake.summaries.lock().unwrap();
        assert_eq!(summaries[0].failures[0].failure_origin, FailureOrigin::Unknown);
    }
    assert_eq!(fake.count("job_failure"), 1);
    assert_eq!(*fake.post_processed.lock().unwrap(), vec![JobStatus::Failed]);
    assert!(fake
        .metric_kinds()
        .contains(&(MetricKind::WorkflowFailure, Some(FailureCause::Unknown))));
    assert_eq!(listener.outcomes_set(), vec![StateField::Failed]);

    assert_eq!(next.job_id, None);
    assert_eq!(next.attempt_number, 1);
    assert!(!next.from_failure);
    assert!(!handle.get_state().running);
    assert_eq!(handle.get_job_information(), JobInformation::non_running());
}

/// Reset-and-skip runs the reset now and the following run without waiting
/// either; the run after that honours the schedule again.
#[tokio::test(start_paused = true)]
async fn test_reset_and_skip_next_scheduling_skips_two_waits() {
    let hour = Duration::from_secs(3600);
    let fake = Fake::new();
    *fake.time_to_wait.lock().unwrap() = hour;
    let (mut orchestrator, handle) = fake.orchestrator();

    handle.reset_connection_and_skip_next_scheduling();
    let start = tokio::time::Instant::now();
    let first = expect_continue(orchestrator.run_iteration(RunRequest::new(fake.connection_id())).await);
    assert!(start.elapsed() < hour);
    assert_eq!(fake.count("job_success"), 1);
    assert!(first.skip_scheduling);

    let start = tokio::time::Instant::now();
    let second = expect_continue(orchestrator.run_iteration(first).await);
    assert!(start.elapsed() < hour);
    assert_eq!(fake.count("job_success"), 2);
    assert!(!second.skip_scheduling);
    assert!(!handle.get_state().skip_scheduling_next_workflow);

    let start = tokio::time::Instant::now();
    expect_continue(orchestrator.run_iteration(second).await);
    assert!(start.elapsed() >= hour);
    assert_eq!(fake.count("job_success"), 3);
}

/// Each terminal path raises exactly one outcome flag, and none survive
/// into the next iteration.
#[tokio::test(start_paused = true)]
async fn test_terminal_outcomes_are_exclusive() {
    // Success.
    let fake = Fake::new();
    let listener = Arc::new(RecordingListener::default());
    let (mut orchestrator, handle) = fake.orchestrator();
    let request = with_listener(RunRequest::new(fake.connection_id()), &listener);
    expect_continue(orchestrator.run_iteration(request).await);
    assert_eq!(listener.outcomes_set(), vec![StateField::Success]);
    assert_no_outcome(&handle);

    // Failure that ends the job.
    let fake = Fake::new();
    fake.previous_failed.store(true, Ordering::SeqCst);
    *fake.destination_check.lock().unwrap() = CheckOutput::failed("disk full");
    let listener = Arc::new(RecordingListener::default());
    let (mut orchestrator, handle) = fake.orchestrator();
    let request = with_listener(RunRequest::new(fake.connection_id()), &listener);
    expect_continue(orchestrator.run_iteration(request).await);
    assert_eq!(fake.count("job_failure"), 1);
    assert_eq!(listener.outcomes_set(), vec![StateField::Failed]);
    assert_no_outcome(&handle);

    // Cancellation for a reset.
    let fake = Fake::new();
    *fake.sync.lock().unwrap() = SyncBehaviour::WaitForCancel;
    let listener = Arc::new(RecordingListener::default());
    let (mut orchestrator, handle) = fake.orchestrator();
    let request = with_listener(RunRequest::new(fake.connection_id()), &listener);
    let task = tokio::spawn(async move { orchestrator.run_iteration(request).await });
    fake.sync_started.notified().await;
    handle.reset_connection();
    expect_continue(task.await.unwrap());
    assert_eq!(fake.count("job_cancelled"), 1);
    assert_eq!(listener.outcomes_set(), vec![StateField::Cancelled]);
    assert_no_outcome(&handle);
}

fn assert_no_outcome(handle: &ConnectionHandle) {
    let state = handle.get_state();
    assert!(!state.success && !state.failed && !state.cancelled);
}
