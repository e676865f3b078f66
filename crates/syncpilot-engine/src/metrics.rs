//! Metrics sink that emits workflow metrics as tracing events.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use syncpilot_types::{FailureCause, MetricKind, WorkflowMetric};

use crate::activities::MetricsSink;

type CounterKey = (MetricKind, Option<FailureCause>);

/// Logs every metric and keeps in-process counters per (kind, cause).
#[derive(Debug, Default)]
pub struct TracingMetricsSink {
    counters: Mutex<BTreeMap<CounterKey, u64>>,
}

impl TracingMetricsSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many metrics of `kind` with `cause` were recorded.
    #[must_use]
    pub fn count(&self, kind: MetricKind, cause: Option<FailureCause>) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.get(&(kind, cause)).copied().unwrap_or(0)
    }

    /// All counters, keyed by kind and cause.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<CounterKey, u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn record_workflow_metric(&self, metric: WorkflowMetric) -> anyhow::Result<()> {
        let attributes = metric
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::info!(
            target: "syncpilot::metrics",
            metric = metric.kind.as_str(),
            connection_id = %metric.connection_id,
            job_id = metric.job_id,
            attempt = metric.attempt_number,
            cause = metric.cause.map(FailureCause::as_str),
            attributes,
            "Workflow metric"
        );
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((metric.kind, metric.cause))
            .or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use syncpilot_types::ConnectionId;

    use super::*;

    #[tokio::test]
    async fn test_counts_by_kind_and_cause() {
        let sink = TracingMetricsSink::new();
        let id = ConnectionId::random();
        sink.record_workflow_metric(WorkflowMetric::new(MetricKind::WorkflowAttempt, id))
            .await
            .unwrap();
        sink.record_workflow_metric(
            WorkflowMetric::new(MetricKind::WorkflowFailure, id).with_cause(FailureCause::Canceled),
        )
        .await
        .unwrap();
        sink.record_workflow_metric(
            WorkflowMetric::new(MetricKind::WorkflowFailure, id).with_cause(FailureCause::Canceled),
        )
        .await
        .unwrap();

        assert_eq!(sink.count(MetricKind::WorkflowAttempt, None), 1);
        assert_eq!(sink.count(MetricKind::WorkflowFailure, Some(FailureCause::Canceled)), 2);
        assert_eq!(sink.count(MetricKind::WorkflowFailure, Some(FailureCause::Activity)), 0);
        assert_eq!(sink.snapshot().len(), 2);
    }
}
