//! Entry point for executor workers.
//!
//! Reporting progress is best effort: a rejected or lost report is
//! logged and counted, but never retried here and never partially
//! applied.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::{HeadError, HeadResult};
use crate::metrics::IngestMetrics;
use crate::registry::{ExecutionRegistry, IngestOutcome};
use crate::snapshot::{
    validate_dataset_key, validate_operator_id, DatasetId, JobId, OperatorId, Snapshot,
};
use crate::state_table::MergeOutcome;
use crate::with_timer;

#[derive(Clone)]
pub struct IngestPort {
    registry: Arc<ExecutionRegistry>,
    metrics: IngestMetrics,
}

impl IngestPort {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self {
            registry,
            metrics: IngestMetrics::new(),
        }
    }

    /// Record one operator progress report.
    pub fn report_progress(&self, snapshot: Snapshot) -> HeadResult<()> {
        self.metrics.received.add(1, &self.metrics.labels);
        if let Err(err) = snapshot.validate() {
            self.metrics.rejected.add(1, &self.metrics.labels);
            tracing::warn!(%err, "rejected progress report");
            return Err(err);
        }

        let outcome = with_timer!(
            self.metrics.ingest_histogram,
            self.metrics.labels,
            self.registry.ingest(&snapshot)
        );
        match outcome {
            IngestOutcome::Merged(MergeOutcome::Stale) => {
                self.metrics.stale.add(1, &self.metrics.labels);
                tracing::debug!(
                    job_id = %snapshot.job_id,
                    dataset = %snapshot.dataset_id,
                    operator = %snapshot.operator_id,
                    timestamp = %snapshot.timestamp,
                    "dropped out of date progress report"
                );
            }
            IngestOutcome::Merged(MergeOutcome::AlreadyTerminal) | IngestOutcome::DatasetSealed => {
                self.metrics.stale.add(1, &self.metrics.labels);
                tracing::debug!(
                    job_id = %snapshot.job_id,
                    dataset = %snapshot.dataset_id,
                    operator = %snapshot.operator_id,
                    "dropped progress report for ended operator"
                );
            }
            IngestOutcome::DatasetEvicted => {
                self.metrics.stale.add(1, &self.metrics.labels);
                tracing::debug!(
                    job_id = %snapshot.job_id,
                    dataset = %snapshot.dataset_id,
                    "dropped progress report for evicted dataset"
                );
            }
            IngestOutcome::Merged(_) => {}
        }
        Ok(())
    }

    /// Record a JSON-encoded progress report as sent by the executor
    /// transport.
    pub fn report_json(&self, payload: &[u8]) -> HeadResult<()> {
        match Snapshot::from_json(payload) {
            Ok(snapshot) => self.report_progress(snapshot),
            Err(err) => {
                self.metrics.received.add(1, &self.metrics.labels);
                self.metrics.rejected.add(1, &self.metrics.labels);
                tracing::warn!(%err, "rejected progress report");
                Err(err)
            }
        }
    }

    /// Declare the operator chain of a dataset that is about to run.
    ///
    /// Operators show up as PENDING in chain order until workers
    /// report on them.
    pub fn register_dataset(
        &self,
        job_id: JobId,
        dataset_id: DatasetId,
        operators: Vec<(OperatorId, String)>,
        at: DateTime<Utc>,
    ) -> HeadResult<()> {
        let checked = validate_dataset_key(&job_id, &dataset_id).and_then(|()| {
            let mut seen = HashSet::new();
            for (operator_id, _label) in &operators {
                validate_operator_id(operator_id)?;
                if !seen.insert(operator_id) {
                    return Err(HeadError::InvalidSnapshot(format!(
                        "operator {operator_id} registered twice for dataset {dataset_id}"
                    )));
                }
            }
            Ok(())
        });
        if let Err(err) = checked {
            tracing::warn!(%err, "rejected dataset registration");
            return Err(err);
        }

        let declared = self
            .registry
            .register_dataset(&job_id, &dataset_id, &operators, at);
        tracing::debug!(%job_id, dataset = %dataset_id, declared, "registered dataset");
        Ok(())
    }

    /// The job ended. Release everything recorded for it and return
    /// how many datasets were dropped.
    pub fn job_ended(&self, job_id: &JobId) -> HeadResult<usize> {
        if job_id.as_str().trim().is_empty() {
            return Err(HeadError::InvalidSnapshot("`job_id` is empty".to_owned()));
        }
        Ok(self.registry.drop_job(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RetentionPolicy;
    use crate::snapshot::{ts, ExecutionState};

    fn port() -> (Arc<ExecutionRegistry>, IngestPort) {
        let registry = Arc::new(ExecutionRegistry::new(RetentionPolicy::unbounded()));
        let port = IngestPort::new(registry.clone());
        (registry, port)
    }

    #[test]
    fn invalid_snapshot_is_not_applied() {
        let (registry, port) = port();
        let snapshot = Snapshot::new("job1", "", "Input0", "Input", ExecutionState::Running, ts(1));

        assert!(matches!(
            port.report_progress(snapshot),
            Err(HeadError::InvalidSnapshot(_))
        ));
        assert!(registry.job_ids().is_empty());
    }

    #[test]
    fn stale_report_still_succeeds() {
        let (registry, port) = port();
        let newer = Snapshot::new("job1", "ds", "Input0", "Input", ExecutionState::Running, ts(5))
            .with_rows(4, Some(20));
        let older = Snapshot::new("job1", "ds", "Input0", "Input", ExecutionState::Running, ts(4))
            .with_rows(2, Some(20));

        port.report_progress(newer).unwrap();
        port.report_progress(older).unwrap();
        assert_eq!(registry.list_datasets(&JobId::from("job1"))[0].progress, 4);
    }

    #[test]
    fn report_json_round_trips_into_registry() {
        let (registry, port) = port();
        let payload = br#"{
            "job_id": "job1",
            "dataset_id": "ds",
            "operator_id": "Input0",
            "operator_label": "Input",
            "state": "FINISHED",
            "rows_completed": 20,
            "rows_total": 20,
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        port.report_json(payload).unwrap();

        let summary = &registry.list_datasets(&JobId::from("job1"))[0];
        assert_eq!(summary.state, ExecutionState::Finished);
        assert_eq!(summary.total, Some(20));
    }

    #[test]
    fn report_json_rejects_garbage() {
        let (registry, port) = port();
        assert!(port.report_json(b"not json").is_err());
        assert!(registry.job_ids().is_empty());
    }

    #[test]
    fn registration_rejects_duplicates_and_blanks() {
        let (registry, port) = port();
        let dup = vec![
            (OperatorId::from("Input0"), "Input".to_owned()),
            (OperatorId::from("Input0"), "Input".to_owned()),
        ];
        assert!(port
            .register_dataset(JobId::from("job1"), DatasetId::from("ds"), dup, ts(1))
            .is_err());

        let blank = vec![(OperatorId::from(""), "Input".to_owned())];
        assert!(port
            .register_dataset(JobId::from("job1"), DatasetId::from("ds"), blank, ts(1))
            .is_err());

        assert!(port
            .register_dataset(JobId::from(""), DatasetId::from("ds"), Vec::new(), ts(1))
            .is_err());
        assert!(registry.job_ids().is_empty());
    }

    #[test]
    fn report_for_evicted_dataset_succeeds_without_effect() {
        let max = std::num::NonZeroUsize::new(1).unwrap();
        let registry = Arc::new(ExecutionRegistry::new(
            RetentionPolicy::max_datasets_per_job(max),
        ));
        let port = IngestPort::new(registry.clone());
        let first = Snapshot::new("job1", "a", "Input0", "Input", ExecutionState::Finished, ts(1));

        port.report_progress(first.clone()).unwrap();
        port.report_progress(Snapshot::new(
            "job1",
            "b",
            "Input0",
            "Input",
            ExecutionState::Running,
            ts(2),
        ))
        .unwrap();
        port.report_progress(first).unwrap();

        let names: Vec<_> = registry
            .list_datasets(&JobId::from("job1"))
            .iter()
            .map(|summary| summary.dataset.to_string())
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn job_end_releases_datasets() {
        let (registry, port) = port();
        for dataset in ["a", "b"] {
            port.report_progress(Snapshot::new(
                "job1",
                dataset,
                "Input0",
                "Input",
                ExecutionState::Running,
                ts(1),
            ))
            .unwrap();
        }

        assert_eq!(port.job_ended(&JobId::from("job1")).unwrap(), 2);
        assert_eq!(port.job_ended(&JobId::from("job1")).unwrap(), 0);
        assert!(registry.job_ids().is_empty());
        assert!(port.job_ended(&JobId::from(" ")).is_err());
    }

    #[test]
    fn registration_declares_pending_operators() {
        let (registry, port) = port();
        let chain = vec![
            (OperatorId::from("Input0"), "Input".to_owned()),
            (
                OperatorId::from("ReadRange->MapBatches(<lambda>)1"),
                "ReadRange->MapBatches(<lambda>)".to_owned(),
            ),
        ];
        port.register_dataset(JobId::from("job1"), DatasetId::from("ds"), chain, ts(1))
            .unwrap();

        let summary = &registry.list_datasets(&JobId::from("job1"))[0];
        assert_eq!(summary.state, ExecutionState::Pending);
        assert_eq!(summary.operators.len(), 2);
        assert!(summary
            .operators
            .iter()
            .all(|op| op.state == ExecutionState::Pending));
    }
}
