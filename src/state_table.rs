//! Latest known state of every operator in one dataset.
//!
//! Workers report the same operator many times, from many places,
//! and reports can arrive late or twice. The table keeps only the
//! newest report per operator, so replaying or reordering reports
//! can never move an operator backwards.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::snapshot::{ExecutionState, OperatorId, Snapshot};

/// Merged view of one operator.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorState {
    pub operator_id: OperatorId,
    pub label: String,
    pub state: ExecutionState,
    pub rows_completed: u64,
    pub rows_total: Option<u64>,
    pub output_rows: u64,
    pub spilled_bytes: u64,
    pub current_bytes: u64,
    pub cpu_cores: f64,
    pub gpu_cores: f64,
    /// Timestamp of the report this state came from.
    pub last_updated: DateTime<Utc>,
}

impl OperatorState {
    fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            operator_id: snapshot.operator_id.clone(),
            label: snapshot.operator_label.clone(),
            state: snapshot.state,
            rows_completed: snapshot.rows_completed,
            rows_total: snapshot.rows_total,
            output_rows: snapshot.output_rows,
            spilled_bytes: snapshot.spilled_bytes,
            current_bytes: snapshot.current_bytes,
            cpu_cores: snapshot.cpu_cores,
            gpu_cores: snapshot.gpu_cores,
            last_updated: snapshot.timestamp,
        }
    }

    fn pending(operator_id: OperatorId, label: String, at: DateTime<Utc>) -> Self {
        Self {
            operator_id,
            label,
            state: ExecutionState::Pending,
            rows_completed: 0,
            rows_total: None,
            output_rows: 0,
            spilled_bytes: 0,
            current_bytes: 0,
            cpu_cores: 0.0,
            gpu_cores: 0.0,
            last_updated: at,
        }
    }

    /// Everything the rollup reads. `last_updated` is not part of it.
    fn same_rollup_inputs(&self, other: &Self) -> bool {
        self.label == other.label
            && self.state == other.state
            && self.rows_completed == other.rows_completed
            && self.rows_total == other.rows_total
            && self.output_rows == other.output_rows
            && self.spilled_bytes == other.spilled_bytes
            && self.current_bytes == other.current_bytes
            && self.cpu_cores == other.cpu_cores
            && self.gpu_cores == other.gpu_cores
    }
}

/// What a [`OperatorStateTable::merge`] did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// First report for this operator.
    Inserted,
    /// A newer report replaced the stored one.
    Updated { rollup_changed: bool },
    /// Not newer than what is stored. Dropped.
    Stale,
    /// The operator already finished or failed. Dropped.
    AlreadyTerminal,
}

impl MergeOutcome {
    pub fn applied(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated { .. })
    }

    /// Whether the dataset rollup has to be recomputed.
    pub fn rollup_changed(self) -> bool {
        matches!(
            self,
            Self::Inserted
                | Self::Updated {
                    rollup_changed: true
                }
        )
    }
}

/// Per-dataset operator table.
///
/// Iteration order is the order operators were first seen in, and
/// never changes afterwards.
#[derive(Debug, Default)]
pub struct OperatorStateTable {
    order: Vec<OperatorId>,
    states: HashMap<OperatorId, OperatorState>,
    /// Operators declared up front that no worker reported yet.
    placeholders: HashSet<OperatorId>,
    /// Number of operators not FINISHED or FAILED.
    unfinished: usize,
    failed: usize,
}

impl OperatorStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a report if it is newer than the stored one.
    pub fn merge(&mut self, snapshot: &Snapshot) -> MergeOutcome {
        let incoming = OperatorState::from_snapshot(snapshot);
        let declared_only = self.placeholders.remove(&snapshot.operator_id);
        match self.states.get_mut(&snapshot.operator_id) {
            None => {
                if !incoming.state.is_terminal() {
                    self.unfinished += 1;
                }
                if incoming.state == ExecutionState::Failed {
                    self.failed += 1;
                }
                self.order.push(incoming.operator_id.clone());
                self.states.insert(incoming.operator_id.clone(), incoming);
                MergeOutcome::Inserted
            }
            Some(stored) if declared_only => {
                // Placeholders are always unfinished.
                if incoming.state.is_terminal() {
                    self.unfinished -= 1;
                }
                if incoming.state == ExecutionState::Failed {
                    self.failed += 1;
                }
                *stored = incoming;
                MergeOutcome::Inserted
            }
            Some(stored) => {
                if stored.state.is_terminal() {
                    return MergeOutcome::AlreadyTerminal;
                }
                if incoming.last_updated <= stored.last_updated {
                    return MergeOutcome::Stale;
                }
                if incoming.state.is_terminal() {
                    self.unfinished -= 1;
                }
                if incoming.state == ExecutionState::Failed {
                    self.failed += 1;
                }
                let rollup_changed = !stored.same_rollup_inputs(&incoming);
                *stored = incoming;
                MergeOutcome::Updated { rollup_changed }
            }
        }
    }

    /// Declare an operator before any worker reported it.
    ///
    /// Returns `false` and leaves the table untouched if the operator
    /// is already known.
    pub fn declare(&mut self, operator_id: OperatorId, label: String, at: DateTime<Utc>) -> bool {
        if self.states.contains_key(&operator_id) {
            return false;
        }
        self.unfinished += 1;
        self.order.push(operator_id.clone());
        self.placeholders.insert(operator_id.clone());
        self.states
            .insert(operator_id.clone(), OperatorState::pending(operator_id, label, at));
        true
    }

    pub fn get(&self, operator_id: &OperatorId) -> Option<&OperatorState> {
        self.states.get(operator_id)
    }

    pub fn contains(&self, operator_id: &OperatorId) -> bool {
        self.states.contains_key(operator_id)
    }

    /// Operators in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &OperatorState> + '_ {
        self.order.iter().filter_map(|id| self.states.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// True once there is at least one operator and all of them are
    /// FINISHED or FAILED.
    pub fn all_terminal(&self) -> bool {
        !self.is_empty() && self.unfinished == 0
    }

    pub fn any_failed(&self) -> bool {
        self.failed > 0
    }

    /// No further progress is expected: everything ended, or
    /// something failed and took the pipeline down with it.
    pub fn is_done(&self) -> bool {
        self.all_terminal() || self.any_failed()
    }
}
