//! Process-wide store of dataset executions.
//!
//! Layout is job → datasets in creation order → operator table.
//! Locking is layered so unrelated work never waits on each other:
//!
//! - The job map is behind a read-mostly [`RwLock`] and is only
//!   write-locked to add or drop a job.
//! - Each job's dataset list has its own [`Mutex`], held just long
//!   enough to look up, append or evict entries.
//! - Each [`DatasetExecution`] serializes its own merges behind its
//!   own [`Mutex`].
//!
//! Readers don't take the dataset mutex in the common case. Every
//! merge that changes the rollup bumps the dataset's version; the
//! last computed [`DatasetSummary`] is published as an immutable
//! [`Arc`] tagged with the version it was computed at. A reader that
//! finds the published summary behind the current version recomputes
//! it once under the dataset lock and publishes the result.
//!
//! Lock order is dataset → published summary. Retention never takes
//! a dataset lock; it only reads each dataset's `sealed` flag.
//!
//! A dataset is sealed once every operator ended or any operator
//! failed. Evicted dataset IDs are remembered per job, so a late or
//! retried report can't bring an evicted dataset back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::aggregate::{recompute, DatasetSummary, Lifespan};
use crate::metrics::RegistryMetrics;
use crate::snapshot::{DatasetId, JobId, OperatorId, Snapshot};
use crate::state_table::{MergeOutcome, OperatorStateTable};

/// How many datasets to keep per job.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// `None` keeps everything for the lifetime of the job.
    pub max_datasets_per_job: Option<NonZeroUsize>,
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn max_datasets_per_job(max: NonZeroUsize) -> Self {
        Self {
            max_datasets_per_job: Some(max),
        }
    }
}

/// What happened to one ingested snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Merged(MergeOutcome),
    /// The dataset already ended. Dropped.
    DatasetSealed,
    /// The dataset ended and was dropped by retention. Dropped.
    DatasetEvicted,
}

impl IngestOutcome {
    pub fn applied(self) -> bool {
        matches!(self, Self::Merged(outcome) if outcome.applied())
    }
}

struct DatasetRecord {
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    operators: OperatorStateTable,
}

struct Published {
    version: u64,
    summary: Arc<DatasetSummary>,
}

/// Result of applying a report to one dataset.
struct Applied {
    outcome: IngestOutcome,
    sealed_now: bool,
}

/// One dataset execution and its cached rollup.
pub struct DatasetExecution {
    job_id: JobId,
    dataset_id: DatasetId,
    created_at: DateTime<Utc>,
    record: Mutex<DatasetRecord>,
    /// Bumped under `record` whenever the rollup inputs change.
    version: AtomicU64,
    published: RwLock<Published>,
    /// Mirrors `record.end_time.is_some()` for lock-free retention.
    sealed: AtomicBool,
}

impl DatasetExecution {
    fn new(job_id: JobId, dataset_id: DatasetId) -> Self {
        let created_at = Utc::now();
        let record = DatasetRecord {
            start_time: None,
            end_time: None,
            operators: OperatorStateTable::new(),
        };
        let summary = Arc::new(recompute(
            &job_id,
            &dataset_id,
            Lifespan {
                start_time: created_at,
                end_time: None,
            },
            &record.operators,
        ));
        Self {
            job_id,
            dataset_id,
            created_at,
            record: Mutex::new(record),
            version: AtomicU64::new(0),
            published: RwLock::new(Published {
                version: 0,
                summary,
            }),
            sealed: AtomicBool::new(false),
        }
    }

    /// Whether the dataset ended, successfully or not.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    fn apply(&self, snapshot: &Snapshot) -> Applied {
        let mut record = self.record.lock();
        if record.end_time.is_some() && record.operators.contains(&snapshot.operator_id) {
            return Applied {
                outcome: IngestOutcome::DatasetSealed,
                sealed_now: false,
            };
        }

        let outcome = record.operators.merge(snapshot);
        if outcome.applied() && record.start_time.is_none() {
            record.start_time = Some(snapshot.timestamp);
        }

        let mut sealed_now = false;
        if outcome.rollup_changed() {
            let done = record.operators.is_done();
            if done && record.end_time.is_none() {
                record.end_time = Some(snapshot.timestamp);
                self.sealed.store(true, Ordering::Release);
                sealed_now = true;
            } else if !done && record.end_time.is_some() {
                // A late operator we had never heard of.
                tracing::info!(
                    job_id = %self.job_id,
                    dataset = %self.dataset_id,
                    operator = %snapshot.operator_id,
                    "new operator reopened a finished dataset"
                );
                record.end_time = None;
                self.sealed.store(false, Ordering::Release);
            }
            self.version.fetch_add(1, Ordering::AcqRel);
        }

        Applied {
            outcome: IngestOutcome::Merged(outcome),
            sealed_now,
        }
    }

    fn declare(&self, operators: &[(OperatorId, String)], at: DateTime<Utc>) -> usize {
        let mut record = self.record.lock();
        let mut declared = 0;
        for (operator_id, label) in operators {
            if record
                .operators
                .declare(operator_id.clone(), label.clone(), at)
            {
                declared += 1;
            }
        }
        if declared > 0 {
            record.start_time.get_or_insert(at);
            if !record.operators.is_done() && record.end_time.take().is_some() {
                self.sealed.store(false, Ordering::Release);
            }
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        declared
    }

    /// Latest rollup. Never older than the last merge that returned.
    pub fn summary(&self) -> Arc<DatasetSummary> {
        let current = self.version.load(Ordering::Acquire);
        {
            let published = self.published.read();
            if published.version == current {
                return published.summary.clone();
            }
        }

        let record = self.record.lock();
        // Stable while we hold the record lock.
        let current = self.version.load(Ordering::Acquire);
        let mut published = self.published.write();
        if published.version != current {
            let lifespan = Lifespan {
                start_time: record.start_time.unwrap_or(self.created_at),
                end_time: record.end_time,
            };
            published.summary = Arc::new(recompute(
                &self.job_id,
                &self.dataset_id,
                lifespan,
                &record.operators,
            ));
            published.version = current;
        }
        published.summary.clone()
    }
}

/// Evicted dataset IDs remembered per job.
const MAX_TOMBSTONES_PER_JOB: usize = 1024;

/// All datasets of one job.
#[derive(Default)]
struct JobDatasets {
    /// Creation order.
    order: Vec<Arc<DatasetExecution>>,
    index: HashMap<DatasetId, Arc<DatasetExecution>>,
    /// Evicted IDs, oldest first in `tombstone_order`.
    tombstones: HashSet<DatasetId>,
    tombstone_order: VecDeque<DatasetId>,
}

impl JobDatasets {
    fn is_evicted(&self, dataset_id: &DatasetId) -> bool {
        self.tombstones.contains(dataset_id)
    }

    fn bury(&mut self, dataset_id: DatasetId) {
        if self.tombstone_order.len() == MAX_TOMBSTONES_PER_JOB {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
        self.tombstones.insert(dataset_id.clone());
        self.tombstone_order.push_back(dataset_id);
    }

    /// Drop the oldest sealed datasets until at most `max` remain.
    fn evict_sealed(&mut self, max: usize) -> Vec<DatasetId> {
        let mut excess = self.order.len().saturating_sub(max);
        if excess == 0 {
            return Vec::new();
        }
        let mut evicted = Vec::new();
        self.order.retain(|dataset| {
            if excess > 0 && dataset.is_sealed() {
                excess -= 1;
                evicted.push(dataset.dataset_id.clone());
                false
            } else {
                true
            }
        });
        for dataset_id in &evicted {
            self.index.remove(dataset_id);
            self.bury(dataset_id.clone());
        }
        evicted
    }
}

/// Owner of every dataset execution in the process.
///
/// Construct one at service start and share it with the ports
/// through an [`Arc`].
pub struct ExecutionRegistry {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobDatasets>>>>,
    retention: RetentionPolicy,
    metrics: RegistryMetrics,
}

impl ExecutionRegistry {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
            metrics: RegistryMetrics::new(),
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    fn job(&self, job_id: &JobId) -> Option<Arc<Mutex<JobDatasets>>> {
        self.jobs.read().get(job_id).cloned()
    }

    fn job_or_create(&self, job_id: &JobId) -> Arc<Mutex<JobDatasets>> {
        if let Some(job) = self.job(job_id) {
            return job;
        }
        self.jobs
            .write()
            .entry(job_id.clone())
            .or_default()
            .clone()
    }

    /// Find a dataset, creating it on first sight.
    ///
    /// Concurrent callers with the same key always get the same
    /// entry. Returns `None` for a dataset retention already evicted.
    pub fn get_or_create_dataset(
        &self,
        job_id: &JobId,
        dataset_id: &DatasetId,
    ) -> Option<Arc<DatasetExecution>> {
        let job = self.job_or_create(job_id);
        let (dataset, evicted) = {
            let mut datasets = job.lock();
            if let Some(dataset) = datasets.index.get(dataset_id) {
                return Some(dataset.clone());
            }
            if datasets.is_evicted(dataset_id) {
                return None;
            }
            let dataset = Arc::new(DatasetExecution::new(job_id.clone(), dataset_id.clone()));
            datasets.order.push(dataset.clone());
            datasets.index.insert(dataset_id.clone(), dataset.clone());
            let evicted = match self.retention.max_datasets_per_job {
                Some(max) => datasets.evict_sealed(max.get()),
                None => Vec::new(),
            };
            (dataset, evicted)
        };

        tracing::info!(%job_id, dataset = %dataset_id, "tracking new dataset");
        self.metrics.datasets_created.add(1, &[]);
        self.record_evictions(job_id, &evicted);
        Some(dataset)
    }

    /// Merge one validated snapshot.
    pub fn ingest(&self, snapshot: &Snapshot) -> IngestOutcome {
        let Some(dataset) = self.get_or_create_dataset(&snapshot.job_id, &snapshot.dataset_id)
        else {
            return IngestOutcome::DatasetEvicted;
        };
        let Applied {
            outcome,
            sealed_now,
        } = dataset.apply(snapshot);
        if sealed_now {
            tracing::info!(
                job_id = %snapshot.job_id,
                dataset = %snapshot.dataset_id,
                state = %dataset.summary().state,
                "dataset ended"
            );
            self.enforce_retention(&snapshot.job_id);
        }
        outcome
    }

    /// Declare a dataset's operator chain before workers report on
    /// it. Returns how many operators were new.
    pub fn register_dataset(
        &self,
        job_id: &JobId,
        dataset_id: &DatasetId,
        operators: &[(OperatorId, String)],
        at: DateTime<Utc>,
    ) -> usize {
        self.get_or_create_dataset(job_id, dataset_id)
            .map_or(0, |dataset| dataset.declare(operators, at))
    }

    /// Summaries of a job's datasets in creation order.
    ///
    /// Unknown jobs have no datasets.
    pub fn list_datasets(&self, job_id: &JobId) -> Vec<Arc<DatasetSummary>> {
        let datasets: Vec<_> = match self.job(job_id) {
            Some(job) => job.lock().order.clone(),
            None => return Vec::new(),
        };
        datasets.iter().map(|dataset| dataset.summary()).collect()
    }

    pub fn dataset_count(&self, job_id: &JobId) -> usize {
        self.job(job_id).map_or(0, |job| job.lock().order.len())
    }

    /// Jobs with at least one tracked dataset, sorted.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut job_ids: Vec<_> = self.jobs.read().keys().cloned().collect();
        job_ids.sort();
        job_ids
    }

    /// Forget a job and all of its datasets, evicted IDs included.
    /// Returns how many datasets were dropped.
    pub fn drop_job(&self, job_id: &JobId) -> usize {
        let removed = self.jobs.write().remove(job_id);
        let count = removed.map_or(0, |job| job.lock().order.len());
        if count > 0 {
            tracing::info!(%job_id, datasets = count, "dropped job");
        }
        count
    }

    fn enforce_retention(&self, job_id: &JobId) {
        let Some(max) = self.retention.max_datasets_per_job else {
            return;
        };
        if let Some(job) = self.job(job_id) {
            let evicted = job.lock().evict_sealed(max.get());
            self.record_evictions(job_id, &evicted);
        }
    }

    fn record_evictions(&self, job_id: &JobId, evicted: &[DatasetId]) {
        for dataset_id in evicted {
            tracing::info!(%job_id, dataset = %dataset_id, "evicted finished dataset");
        }
        if !evicted.is_empty() {
            self.metrics
                .datasets_evicted
                .add(evicted.len() as u64, &[]);
        }
    }
}
