//! Data model for progress reports coming from executor workers.
//!
//! A [`Snapshot`] is one worker's view of one operator at one point
//! in time. Snapshots are plain values: they are validated once at
//! the ingest boundary and never mutated afterwards.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{HeadError, HeadResult};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Display for $name {
            fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
                fmt.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque ID of the job that submitted a dataset.
    JobId
);

string_id!(
    /// Name of one dataset execution.
    ///
    /// Unique within a job; running the same pipeline twice produces
    /// two IDs.
    DatasetId
);

string_id!(
    /// Unique ID of an operator within a dataset, usually the
    /// operator name suffixed with its position in the chain, like
    /// `Input0`.
    OperatorId
);

/// Lifecycle of an operator, and derived from that, of a dataset.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Running,
    Finished,
    Failed,
}

impl ExecutionState {
    /// No further updates are expected once terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl Display for ExecutionState {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        };
        fmt.write_str(s)
    }
}

/// One progress report for one operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub job_id: JobId,
    pub dataset_id: DatasetId,
    pub operator_id: OperatorId,
    /// Display name. Several operators can share one.
    pub operator_label: String,
    pub state: ExecutionState,
    #[serde(default)]
    pub rows_completed: u64,
    /// Unknown until the operator has been planned.
    #[serde(default)]
    pub rows_total: Option<u64>,
    #[serde(default)]
    pub output_rows: u64,
    #[serde(default)]
    pub spilled_bytes: u64,
    #[serde(default)]
    pub current_bytes: u64,
    #[serde(default)]
    pub cpu_cores: f64,
    #[serde(default)]
    pub gpu_cores: f64,
    /// When the worker took this snapshot. Newer always wins.
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// A report with all counters and gauges zeroed.
    pub fn new(
        job_id: impl Into<JobId>,
        dataset_id: impl Into<DatasetId>,
        operator_id: impl Into<OperatorId>,
        operator_label: impl Into<String>,
        state: ExecutionState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            dataset_id: dataset_id.into(),
            operator_id: operator_id.into(),
            operator_label: operator_label.into(),
            state,
            rows_completed: 0,
            rows_total: None,
            output_rows: 0,
            spilled_bytes: 0,
            current_bytes: 0,
            cpu_cores: 0.0,
            gpu_cores: 0.0,
            timestamp,
        }
    }

    pub fn with_rows(mut self, completed: u64, total: Option<u64>) -> Self {
        self.rows_completed = completed;
        self.rows_total = total;
        self
    }

    pub fn with_output_rows(mut self, output_rows: u64) -> Self {
        self.output_rows = output_rows;
        self
    }

    pub fn with_bytes(mut self, spilled: u64, current: u64) -> Self {
        self.spilled_bytes = spilled;
        self.current_bytes = current;
        self
    }

    pub fn with_cores(mut self, cpu: f64, gpu: f64) -> Self {
        self.cpu_cores = cpu;
        self.gpu_cores = gpu;
        self
    }

    /// Decode a snapshot sent as JSON by the executor transport.
    ///
    /// Negative counters fail here since they can't fit the unsigned
    /// fields.
    pub fn from_json(payload: &[u8]) -> HeadResult<Self> {
        let snapshot: Self = serde_json::from_slice(payload)
            .map_err(|err| HeadError::InvalidSnapshot(err.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Check everything the type system doesn't.
    pub fn validate(&self) -> HeadResult<()> {
        if self.job_id.is_blank() {
            return Err(HeadError::InvalidSnapshot("`job_id` is empty".to_owned()));
        }
        if self.dataset_id.is_blank() {
            return Err(HeadError::InvalidSnapshot(format!(
                "`dataset_id` is empty in report for job {}",
                self.job_id
            )));
        }
        if self.operator_id.is_blank() {
            return Err(HeadError::InvalidSnapshot(format!(
                "`operator_id` is empty in report for dataset {}",
                self.dataset_id
            )));
        }
        for (field, value) in [("cpu_cores", self.cpu_cores), ("gpu_cores", self.gpu_cores)] {
            if !value.is_finite() || value < 0.0 {
                return Err(HeadError::InvalidSnapshot(format!(
                    "`{field}` must be a non-negative number, got {value} for operator {}",
                    self.operator_id
                )));
            }
        }
        Ok(())
    }
}

/// Check an operator ID coming from a dataset registration.
pub(crate) fn validate_operator_id(operator_id: &OperatorId) -> HeadResult<()> {
    if operator_id.is_blank() {
        Err(HeadError::InvalidSnapshot(
            "`operator_id` is empty in dataset registration".to_owned(),
        ))
    } else {
        Ok(())
    }
}

/// Check the IDs naming a dataset.
pub(crate) fn validate_dataset_key(job_id: &JobId, dataset_id: &DatasetId) -> HeadResult<()> {
    if job_id.is_blank() {
        Err(HeadError::InvalidSnapshot("`job_id` is empty".to_owned()))
    } else if dataset_id.is_blank() {
        Err(HeadError::InvalidSnapshot(format!(
            "`dataset_id` is empty for job {job_id}"
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    use chrono::TimeZone;

    Utc.timestamp_opt(secs, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_test::{assert_tokens, Token};

    fn input_snapshot() -> Snapshot {
        Snapshot::new(
            "job1",
            "data_head_test_0",
            "Input0",
            "Input",
            ExecutionState::Running,
            ts(10),
        )
        .with_rows(5, Some(20))
    }

    #[test]
    fn state_serializes_screaming() {
        assert_tokens(
            &ExecutionState::Finished,
            &[Token::UnitVariant {
                name: "ExecutionState",
                variant: "FINISHED",
            }],
        );
        assert_tokens(
            &ExecutionState::Pending,
            &[Token::UnitVariant {
                name: "ExecutionState",
                variant: "PENDING",
            }],
        );
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionState::Finished.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(!ExecutionState::Pending.is_terminal());
    }

    #[test]
    fn valid_snapshot_passes() {
        assert!(input_snapshot().validate().is_ok());
    }

    #[test]
    fn empty_ids_are_rejected() {
        let mut snapshot = input_snapshot();
        snapshot.job_id = JobId::from("");
        assert!(matches!(
            snapshot.validate(),
            Err(HeadError::InvalidSnapshot(_))
        ));

        let mut snapshot = input_snapshot();
        snapshot.dataset_id = DatasetId::from("  ");
        assert!(matches!(
            snapshot.validate(),
            Err(HeadError::InvalidSnapshot(_))
        ));

        let mut snapshot = input_snapshot();
        snapshot.operator_id = OperatorId::from("");
        assert!(matches!(
            snapshot.validate(),
            Err(HeadError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn negative_or_nan_gauges_are_rejected() {
        let snapshot = input_snapshot().with_cores(-1.0, 0.0);
        assert!(snapshot.validate().is_err());

        let snapshot = input_snapshot().with_cores(0.5, f64::NAN);
        assert!(snapshot.validate().is_err());

        let snapshot = input_snapshot().with_cores(0.5, f64::INFINITY);
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn from_json_applies_defaults() {
        let payload = br#"{
            "job_id": "job1",
            "dataset_id": "data_head_test_0",
            "operator_id": "Input0",
            "operator_label": "Input",
            "state": "RUNNING",
            "rows_completed": 3,
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        let snapshot = Snapshot::from_json(payload).unwrap();
        assert_eq!(snapshot.rows_completed, 3);
        assert_eq!(snapshot.rows_total, None);
        assert_eq!(snapshot.output_rows, 0);
        assert_eq!(snapshot.state, ExecutionState::Running);
    }

    #[test]
    fn from_json_rejects_negative_counters() {
        let payload = br#"{
            "job_id": "job1",
            "dataset_id": "data_head_test_0",
            "operator_id": "Input0",
            "operator_label": "Input",
            "state": "RUNNING",
            "rows_completed": -3,
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        assert!(matches!(
            Snapshot::from_json(payload),
            Err(HeadError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn from_json_rejects_unknown_state() {
        let payload = br#"{
            "job_id": "job1",
            "dataset_id": "d",
            "operator_id": "Input0",
            "operator_label": "Input",
            "state": "DONE",
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;
        assert!(Snapshot::from_json(payload).is_err());
    }
}
