//! Dataset rollups.
//!
//! [`recompute`] turns an operator table into the summary served by
//! the query port. It is a pure function of its inputs; caching and
//! invalidation live in [`crate::registry`].

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::snapshot::{DatasetId, ExecutionState, JobId, OperatorId};
use crate::state_table::{OperatorState, OperatorStateTable};

/// When a dataset started and, once every operator is done, ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Lifespan {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Per-operator entry of a [`DatasetSummary`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorSummary {
    /// Display label.
    pub name: String,
    /// Unique operator ID.
    pub operator: OperatorId,
    pub state: ExecutionState,
    pub progress: u64,
    pub total: Option<u64>,
    pub total_rows: u64,
    pub ray_data_output_rows: u64,
    pub ray_data_spilled_bytes: u64,
    pub ray_data_current_bytes: u64,
    pub ray_data_cpu_usage_cores: f64,
    pub ray_data_gpu_usage_cores: f64,
}

impl From<&OperatorState> for OperatorSummary {
    fn from(op: &OperatorState) -> Self {
        Self {
            name: op.label.clone(),
            operator: op.operator_id.clone(),
            state: op.state,
            progress: op.rows_completed,
            total: op.rows_total,
            total_rows: op.output_rows,
            ray_data_output_rows: op.output_rows,
            ray_data_spilled_bytes: op.spilled_bytes,
            ray_data_current_bytes: op.current_bytes,
            ray_data_cpu_usage_cores: op.cpu_cores,
            ray_data_gpu_usage_cores: op.gpu_cores,
        }
    }
}

/// Point-in-time view of one dataset execution.
///
/// The field set is the wire schema of `GET /api/data/datasets/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetSummary {
    pub dataset: DatasetId,
    pub job_id: JobId,
    #[serde(serialize_with = "serialize_epoch_secs")]
    pub start_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_opt_epoch_secs")]
    pub end_time: Option<DateTime<Utc>>,
    pub state: ExecutionState,
    pub progress: u64,
    /// `None` while any operator's total is unknown.
    pub total: Option<u64>,
    pub total_rows: u64,
    pub ray_data_output_rows: u64,
    pub ray_data_spilled_bytes: u64,
    pub ray_data_current_bytes: u64,
    pub ray_data_cpu_usage_cores: f64,
    pub ray_data_gpu_usage_cores: f64,
    pub operators: Vec<OperatorSummary>,
}

fn epoch_secs(at: &DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

fn serialize_epoch_secs<S: Serializer>(at: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(epoch_secs(at))
}

fn serialize_opt_epoch_secs<S: Serializer>(
    at: &Option<DateTime<Utc>>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match at {
        Some(at) => s.serialize_some(&epoch_secs(at)),
        None => s.serialize_none(),
    }
}

/// Dataset state from its operators' states.
///
/// Any failure wins. Otherwise the dataset is finished only when
/// every operator is, running once anything has made progress, and
/// pending before that.
pub fn derive_state<'a>(operators: impl IntoIterator<Item = &'a OperatorState>) -> ExecutionState {
    let mut seen_any = false;
    let mut all_finished = true;
    let mut progressed = false;
    for op in operators {
        seen_any = true;
        match op.state {
            ExecutionState::Failed => return ExecutionState::Failed,
            ExecutionState::Finished => progressed = true,
            ExecutionState::Running => {
                progressed = true;
                all_finished = false;
            }
            ExecutionState::Pending => {
                progressed |= op.rows_completed > 0;
                all_finished = false;
            }
        }
    }
    if seen_any && all_finished {
        ExecutionState::Finished
    } else if progressed {
        ExecutionState::Running
    } else {
        ExecutionState::Pending
    }
}

/// Roll the operator table up into a dataset summary.
pub fn recompute(
    job_id: &JobId,
    dataset_id: &DatasetId,
    lifespan: Lifespan,
    operators: &OperatorStateTable,
) -> DatasetSummary {
    let mut progress = 0u64;
    let mut total = if operators.is_empty() { None } else { Some(0u64) };
    let mut output_rows = 0u64;
    let mut spilled_bytes = 0u64;
    let mut current_bytes = 0u64;
    let mut cpu_cores = 0.0;
    let mut gpu_cores = 0.0;

    for op in operators.iter() {
        progress = progress.saturating_add(op.rows_completed);
        total = total.and_then(|sum| op.rows_total.map(|t| sum.saturating_add(t)));
        output_rows = output_rows.saturating_add(op.output_rows);
        spilled_bytes = spilled_bytes.saturating_add(op.spilled_bytes);
        current_bytes = current_bytes.saturating_add(op.current_bytes);
        // Cores are a gauge: only operators still running hold any.
        if !op.state.is_terminal() {
            cpu_cores += op.cpu_cores;
            gpu_cores += op.gpu_cores;
        }
    }

    DatasetSummary {
        dataset: dataset_id.clone(),
        job_id: job_id.clone(),
        start_time: lifespan.start_time,
        end_time: lifespan.end_time,
        state: derive_state(operators.iter()),
        progress,
        total,
        total_rows: output_rows,
        ray_data_output_rows: output_rows,
        ray_data_spilled_bytes: spilled_bytes,
        ray_data_current_bytes: current_bytes,
        ray_data_cpu_usage_cores: cpu_cores,
        ray_data_gpu_usage_cores: gpu_cores,
        operators: operators.iter().map(OperatorSummary::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::snapshot::{ts, Snapshot};

    fn lifespan() -> Lifespan {
        Lifespan {
            start_time: ts(100),
            end_time: None,
        }
    }

    fn table(reports: &[Snapshot]) -> OperatorStateTable {
        let mut table = OperatorStateTable::new();
        for report in reports {
            table.merge(report);
        }
        table
    }

    fn op(id: &str, state: ExecutionState) -> Snapshot {
        Snapshot::new("job1", "ds", id, id.trim_end_matches(char::is_numeric), state, ts(100))
    }

    fn summarize(reports: &[Snapshot]) -> DatasetSummary {
        recompute(
            &JobId::from("job1"),
            &DatasetId::from("ds"),
            lifespan(),
            &table(reports),
        )
    }

    #[test]
    fn all_finished_is_finished() {
        let summary = summarize(&[
            op("A0", ExecutionState::Finished).with_rows(20, Some(20)),
            op("B1", ExecutionState::Finished).with_rows(20, Some(20)),
        ]);
        assert_eq!(summary.state, ExecutionState::Finished);
        assert_eq!(summary.progress, 40);
        assert_eq!(summary.total, Some(40));
    }

    #[test]
    fn finished_and_running_is_running() {
        let summary = summarize(&[
            op("A0", ExecutionState::Finished).with_rows(20, Some(20)),
            op("B1", ExecutionState::Running).with_rows(4, Some(20)),
        ]);
        assert_eq!(summary.state, ExecutionState::Running);
    }

    #[test]
    fn finished_and_pending_is_running() {
        let summary = summarize(&[
            op("A0", ExecutionState::Finished),
            op("B1", ExecutionState::Pending),
        ]);
        assert_eq!(summary.state, ExecutionState::Running);
    }

    #[test]
    fn any_failure_is_failed() {
        let summary = summarize(&[
            op("A0", ExecutionState::Running),
            op("B1", ExecutionState::Failed),
            op("C2", ExecutionState::Finished),
        ]);
        assert_eq!(summary.state, ExecutionState::Failed);
    }

    #[test]
    fn untouched_operators_are_pending() {
        let summary = summarize(&[op("A0", ExecutionState::Pending), op("B1", ExecutionState::Pending)]);
        assert_eq!(summary.state, ExecutionState::Pending);

        let summary = summarize(&[
            op("A0", ExecutionState::Pending).with_rows(1, None),
            op("B1", ExecutionState::Pending),
        ]);
        assert_eq!(summary.state, ExecutionState::Running);
    }

    #[test]
    fn empty_dataset_is_pending_with_unknown_total() {
        let summary = summarize(&[]);
        assert_eq!(summary.state, ExecutionState::Pending);
        assert_eq!(summary.total, None);
        assert!(summary.operators.is_empty());
    }

    #[test]
    fn unknown_total_propagates() {
        let summary = summarize(&[
            op("A0", ExecutionState::Running).with_rows(5, Some(20)),
            op("B1", ExecutionState::Running).with_rows(1, None),
        ]);
        assert_eq!(summary.progress, 6);
        assert_eq!(summary.total, None);
    }

    #[test]
    fn counters_sum_and_cores_only_count_active_operators() {
        let summary = summarize(&[
            op("A0", ExecutionState::Finished)
                .with_output_rows(100)
                .with_bytes(10, 1)
                .with_cores(4.0, 1.0),
            op("B1", ExecutionState::Running)
                .with_output_rows(50)
                .with_bytes(5, 2)
                .with_cores(2.0, 0.5),
        ]);
        assert_eq!(summary.total_rows, 150);
        assert_eq!(summary.ray_data_output_rows, 150);
        assert_eq!(summary.ray_data_spilled_bytes, 15);
        assert_eq!(summary.ray_data_current_bytes, 3);
        assert_eq!(summary.ray_data_cpu_usage_cores, 2.0);
        assert_eq!(summary.ray_data_gpu_usage_cores, 0.5);

        // Per-operator entries keep what was reported.
        assert_eq!(summary.operators[0].ray_data_cpu_usage_cores, 4.0);
    }

    #[test]
    fn counters_saturate() {
        let summary = summarize(&[
            op("A0", ExecutionState::Running).with_rows(u64::MAX, Some(u64::MAX)),
            op("B1", ExecutionState::Running).with_rows(1, Some(1)),
        ]);
        assert_eq!(summary.progress, u64::MAX);
        assert_eq!(summary.total, Some(u64::MAX));
    }

    #[test]
    fn recompute_is_deterministic() {
        let reports = [
            op("A0", ExecutionState::Running).with_rows(3, Some(9)).with_cores(0.25, 0.0),
            op("B1", ExecutionState::Pending),
        ];
        let table = table(&reports);
        let a = recompute(&JobId::from("job1"), &DatasetId::from("ds"), lifespan(), &table);
        let b = recompute(&JobId::from("job1"), &DatasetId::from("ds"), lifespan(), &table);
        assert_eq!(a, b);
    }

    #[test]
    fn json_schema_is_exact() {
        let summary = summarize(&[op("Input0", ExecutionState::Running)]);
        let json = serde_json::to_value(&summary).unwrap();

        let keys: BTreeSet<_> = json.as_object().unwrap().keys().cloned().collect();
        let expected: BTreeSet<_> = [
            "dataset",
            "job_id",
            "start_time",
            "end_time",
            "state",
            "progress",
            "total",
            "total_rows",
            "ray_data_output_rows",
            "ray_data_spilled_bytes",
            "ray_data_current_bytes",
            "ray_data_cpu_usage_cores",
            "ray_data_gpu_usage_cores",
            "operators",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(keys, expected);

        let op_keys: BTreeSet<_> = json["operators"][0]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        let expected: BTreeSet<_> = [
            "name",
            "operator",
            "state",
            "progress",
            "total",
            "total_rows",
            "ray_data_output_rows",
            "ray_data_spilled_bytes",
            "ray_data_current_bytes",
            "ray_data_cpu_usage_cores",
            "ray_data_gpu_usage_cores",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(op_keys, expected);
    }

    #[test]
    fn json_times_are_epoch_seconds() {
        let mut summary = summarize(&[op("Input0", ExecutionState::Finished)]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["start_time"], serde_json::json!(100.0));
        assert!(json["end_time"].is_null());
        assert_eq!(json["state"], "FINISHED");
        assert!(json["total"].is_null());

        summary.end_time = Some(ts(130));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["end_time"], serde_json::json!(130.0));
    }
}
