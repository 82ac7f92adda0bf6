//! REST endpoints for inspecting and nudging the pipeline

pub mod downloads;
pub mod health;
pub mod history;
pub mod jobs;
pub mod metrics;

use axum::http::StatusCode;
use tracing::error;

/// Log an internal error and map it to a 500
pub(crate) fn internal_error(context: &str, e: anyhow::Error) -> StatusCode {
    error!(error = %e, "{}", context);
    StatusCode::INTERNAL_SERVER_ERROR
}
