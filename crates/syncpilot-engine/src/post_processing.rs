//! Detached post-processing of finished jobs.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use syncpilot_state::StateBackend;
use syncpilot_types::{ConnectionId, JobId, JobStatus, SyncStats};
use tokio::sync::oneshot;

use crate::activities::PostProcessor;
use crate::persistence::blocking;

/// Id of the post-processing operation of `job_id`.
#[must_use]
pub fn post_processing_id(job_id: JobId) -> String {
    format!("post_sync_{job_id}")
}

/// Rolls attempt stats up into the job once it is finished.
///
/// Runs on its own task so the loop never waits for it. At most one run per
/// job is in flight at a time.
pub struct DetachedPostProcessor {
    backend: Arc<dyn StateBackend>,
    started: Arc<Mutex<HashSet<JobId>>>,
}

impl DetachedPostProcessor {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend, started: Arc::new(Mutex::new(HashSet::new())) }
    }

    fn claim(&self, job_id: JobId) -> bool {
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id)
    }
}

fn release(started: &Mutex<HashSet<JobId>>, job_id: JobId) {
    started
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&job_id);
}

async fn finalize(backend: Arc<dyn StateBackend>, job_id: JobId, status: JobStatus) -> Result<SyncStats> {
    blocking(move || {
        let attempts = backend.list_attempts(job_id)?;
        let total = attempts.iter().fold(SyncStats::default(), |acc, a| SyncStats {
            records_emitted: acc.records_emitted + a.stats.records_emitted,
            records_committed: acc.records_committed + a.stats.records_committed,
            bytes_emitted: acc.bytes_emitted + a.stats.bytes_emitted,
            bytes_committed: acc.bytes_committed + a.stats.bytes_committed,
        });
        backend.set_job_stats(job_id, &total)?;
        if let Some(last) = attempts.last() {
            backend.append_attempt_log(
                job_id,
                last.attempt_number,
                "info",
                &format!("Post-processing finished for {} job", status.as_str()),
            )?;
        }
        Ok(total)
    })
    .await
}

#[async_trait]
impl PostProcessor for DetachedPostProcessor {
    async fn start_post_processing(
        &self,
        job_id: JobId,
        connection_id: ConnectionId,
        status: JobStatus,
    ) -> Result<()> {
        let operation = post_processing_id(job_id);
        if !self.claim(job_id) {
            tracing::debug!(%connection_id, operation = %operation, "Post-processing already started");
            return Ok(());
        }

        let (started_tx, started_rx) = oneshot::channel();
        let backend = self.backend.clone();
        let started = self.started.clone();
        tokio::spawn(async move {
            let _ = started_tx.send(());
            let outcome = finalize(backend, job_id, status).await;
            release(&started, job_id);
            match outcome {
                Ok(stats) => tracing::info!(
                    %connection_id,
                    job_id,
                    records_committed = stats.records_committed,
                    "Post-processing finished"
                ),
                Err(e) => tracing::warn!(%connection_id, job_id, error = %e, "Post-processing failed"),
            }
        });

        if let Err(e) = started_rx.await {
            release(&self.started, job_id);
            return Err(e).with_context(|| format!("{operation} did not start"));
        }
        tracing::debug!(%connection_id, operation = %operation, "Post-processing started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use syncpilot_state::SqliteStateBackend;
    use syncpilot_types::{AttemptStatus, JobKind};

    use super::*;

    #[test]
    fn test_operation_id() {
        assert_eq!(post_processing_id(42), "post_sync_42");
    }

    #[tokio::test]
    async fn test_rolls_up_attempt_stats() {
        let backend = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let conn = ConnectionId::random();
        let job = backend.create_job(conn, JobKind::Sync, true).unwrap();
        for committed in [3, 4] {
            let attempt = backend.create_attempt(job).unwrap();
            let stats = SyncStats { records_committed: committed, ..SyncStats::default() };
            backend
                .finish_attempt(job, attempt, AttemptStatus::Failed, Some(&stats), None)
                .unwrap();
        }

        let processor = DetachedPostProcessor::new(backend.clone());
        processor
            .start_post_processing(job, conn, JobStatus::Failed)
            .await
            .unwrap();

        let mut rolled_up = None;
        for _ in 0..100 {
            rolled_up = backend.get_job(job).unwrap().and_then(|j| j.stats);
            if rolled_up.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rolled_up.map(|s| s.records_committed), Some(7));

        let mut in_flight = usize::MAX;
        for _ in 0..100 {
            in_flight = processor.started.lock().unwrap().len();
            if in_flight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(in_flight, 0);
        // Finished jobs can be post-processed again.
        assert!(processor.claim(job));
    }

    #[tokio::test]
    async fn test_started_once_per_job() {
        let backend = Arc::new(SqliteStateBackend::in_memory().unwrap());
        let processor = DetachedPostProcessor::new(backend);
        assert!(processor.claim(1));
        assert!(!processor.claim(1));
        assert!(processor.claim(2));
        processor
            .start_post_processing(1, ConnectionId::random(), JobStatus::Succeeded)
            .await
            .unwrap();
    }
}
