//! Service assembly.
//!
//! [`DataHead`] owns the registry for as long as the service runs and
//! hands out the two ports bound to it. Nothing here is global: two
//! `DataHead`s in one process never see each other's datasets.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::HeadConfig;
use crate::errors::HeadResult;
use crate::ingest::IngestPort;
use crate::query::QueryPort;
use crate::registry::{ExecutionRegistry, RetentionPolicy};
use crate::webserver::run_webserver;

pub struct DataHead {
    registry: Arc<ExecutionRegistry>,
    ingest: IngestPort,
    query: Arc<QueryPort>,
}

impl DataHead {
    pub fn new(retention: RetentionPolicy) -> Self {
        let registry = Arc::new(ExecutionRegistry::new(retention));
        Self {
            ingest: IngestPort::new(registry.clone()),
            query: Arc::new(QueryPort::new(registry.clone())),
            registry,
        }
    }

    pub fn from_config(config: &HeadConfig) -> Self {
        Self::new(config.retention())
    }

    /// Port handed to executor workers. Cheap to clone.
    pub fn ingest(&self) -> &IngestPort {
        &self.ingest
    }

    pub fn query(&self) -> &Arc<QueryPort> {
        &self.query
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Serve the HTTP query surface until `shutdown` resolves.
    pub async fn serve<F>(&self, addr: SocketAddr, shutdown: F) -> HeadResult<()>
    where
        F: Future<Output = ()>,
    {
        run_webserver(addr, self.query.clone(), shutdown).await
    }
}
