//! Error type shared by the ingest and query ports, the config loader
//! and the service bootstrap.
//!
//! Only [`HeadError::InvalidSnapshot`] and [`HeadError::InvalidJobId`]
//! are caused by callers. Everything else is a startup failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Result type used across the crate.
pub type HeadResult<T> = Result<T, HeadError>;

#[derive(Debug, thiserror::Error)]
pub enum HeadError {
    /// A progress report was malformed. It is rejected as a whole.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// A query named a job id that can't possibly exist.
    #[error("invalid job id: {0:?}")]
    InvalidJobId(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unable to initialize metrics: {0}")]
    Metrics(String),

    #[error("unable to initialize tracing: {0}")]
    Tracing(String),

    #[error("webserver error: {0}")]
    Server(String),
}

impl HeadError {
    /// Stable identifier put in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSnapshot(_) => "INVALID_SNAPSHOT",
            Self::InvalidJobId(_) => "INVALID_JOB_ID",
            Self::Config(_) => "CONFIG",
            Self::Metrics(_) => "METRICS",
            Self::Tracing(_) => "TRACING",
            Self::Server(_) => "INTERNAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidSnapshot(_) | Self::InvalidJobId(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for HeadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
