use axum::{
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};

use crate::errors::{HeadError, HeadResult};
use crate::metrics::render_metrics;
use crate::query::{DatasetsResponse, JobsResponse, QueryPort};

pub fn router(query: Arc<QueryPort>) -> Router {
    Router::new()
        .route("/api/data/datasets/:job_id", get(get_datasets))
        .route("/api/data/jobs", get(get_jobs))
        .route("/metrics", get(get_metrics))
        .layer(Extension(query))
}

/// Serve the query surface until `shutdown` resolves.
pub async fn run_webserver<F>(addr: SocketAddr, query: Arc<QueryPort>, shutdown: F) -> HeadResult<()>
where
    F: Future<Output = ()>,
{
    let app = router(query);
    tracing::info!("Starting data head API server on {addr:?}");

    axum::Server::try_bind(&addr)
        .map_err(|err| HeadError::Server(format!("unable to bind {addr}: {err}")))?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| HeadError::Server(err.to_string()))?;

    tracing::info!("data head API server stopped");
    Ok(())
}

async fn get_datasets(
    Path(job_id): Path<String>,
    Extension(query): Extension<Arc<QueryPort>>,
) -> Result<Json<DatasetsResponse>, HeadError> {
    query.datasets(&job_id).map(Json).map_err(|err| {
        tracing::debug!(%err, "rejected dataset query");
        err
    })
}

async fn get_jobs(Extension(query): Extension<Arc<QueryPort>>) -> Json<JobsResponse> {
    Json(query.jobs())
}

async fn get_metrics() -> Result<impl IntoResponse, HeadError> {
    let (content_type, buf) = render_metrics()?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, content_type)], buf))
}
