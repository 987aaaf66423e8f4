//! Execution-state aggregator for distributed data pipelines.
//!
//! Executor workers push operator progress snapshots through the
//! [`ingest::IngestPort`]. The [`registry::ExecutionRegistry`] merges
//! them per job and dataset, and the [`query::QueryPort`] serves
//! rolled up dataset summaries to the HTTP layer in
//! [`webserver`].
//!
//! Data flows one way:
//!
//! ```text
//! worker -> IngestPort -> ExecutionRegistry -> OperatorStateTable
//!                                 |
//!                     recompute (cached per dataset)
//!                                 |
//!                  QueryPort <- DatasetSummary
//! ```

pub mod aggregate;
pub mod config;
pub mod errors;
pub mod ingest;
#[macro_use]
pub mod metrics;
pub mod query;
pub mod registry;
pub mod run;
pub mod snapshot;
pub mod state_table;
pub mod tracing;
pub mod webserver;

pub use crate::aggregate::{DatasetSummary, OperatorSummary};
pub use crate::config::HeadConfig;
pub use crate::errors::{HeadError, HeadResult};
pub use crate::ingest::IngestPort;
pub use crate::query::{DatasetsResponse, JobsResponse, QueryPort};
pub use crate::registry::{ExecutionRegistry, RetentionPolicy};
pub use crate::run::DataHead;
pub use crate::snapshot::{DatasetId, ExecutionState, JobId, OperatorId, Snapshot};
