//! Read side used by the HTTP layer.

use std::sync::Arc;

use serde::Serialize;

use crate::aggregate::DatasetSummary;
use crate::errors::{HeadError, HeadResult};
use crate::registry::ExecutionRegistry;
use crate::snapshot::JobId;

/// Body of `GET /api/data/datasets/{job_id}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetsResponse {
    pub datasets: Vec<DatasetSummary>,
}

/// Body of `GET /api/data/jobs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobsResponse {
    pub jobs: Vec<JobId>,
}

pub struct QueryPort {
    registry: Arc<ExecutionRegistry>,
}

impl QueryPort {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self { registry }
    }

    /// Every dataset recorded for a job, oldest first.
    ///
    /// A job nobody reported on yet is not an error, it just has no
    /// datasets. The summaries are copies, later ingests do not show
    /// up in an already returned response.
    pub fn datasets(&self, job_id: &str) -> HeadResult<DatasetsResponse> {
        let job_id = parse_job_id(job_id)?;
        let datasets = self
            .registry
            .list_datasets(&job_id)
            .iter()
            .map(|summary| DatasetSummary::clone(summary))
            .collect();
        Ok(DatasetsResponse { datasets })
    }

    /// Jobs with recorded datasets, sorted.
    pub fn jobs(&self) -> JobsResponse {
        JobsResponse {
            jobs: self.registry.job_ids(),
        }
    }
}

fn parse_job_id(raw: &str) -> HeadResult<JobId> {
    if raw.trim().is_empty() || raw.chars().any(char::is_control) {
        Err(HeadError::InvalidJobId(raw.to_owned()))
    } else {
        Ok(JobId::from(raw))
    }
}
