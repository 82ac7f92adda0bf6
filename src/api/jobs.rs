//! Processing queue endpoints

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use uuid::Uuid;

use super::internal_error;
use crate::app::AppState;
use crate::db::{ProcessingJobRecord, QueueStats};

/// How many jobs the recent list returns
const RECENT_LIMIT: i64 = 50;

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn stats(State(state): State<AppState>) -> Result<Json<QueueStats>, StatusCode> {
    state
        .db
        .processing_jobs()
        .stats()
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to load queue stats", e))
}

async fn recent(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProcessingJobRecord>>, StatusCode> {
    state
        .db
        .processing_jobs()
        .recent(RECENT_LIMIT)
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to list jobs", e))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessingJobRecord>, StatusCode> {
    state
        .db
        .processing_jobs()
        .get(id)
        .await
        .map_err(|e| internal_error("Failed to load job", e))?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Put a failed job back in the queue with a fresh retry budget
async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RetryResponse>), StatusCode> {
    let jobs = state.db.processing_jobs();
    if jobs
        .get(id)
        .await
        .map_err(|e| internal_error("Failed to load job", e))?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }

    let requeued = jobs
        .reset_failed(id)
        .await
        .map_err(|e| internal_error("Failed to requeue job", e))?;

    if requeued {
        tracing::info!(job_id = %id, "Failed job requeued via API");
        Ok((
            StatusCode::OK,
            Json(RetryResponse {
                success: true,
                error: None,
            }),
        ))
    } else {
        Ok((
            StatusCode::CONFLICT,
            Json(RetryResponse {
                success: false,
                error: Some(
                    "Job is not failed or its download already has an active job".to_string(),
                ),
            }),
        ))
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/jobs/recent", get(recent))
        .route("/api/jobs/stats", get(stats))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/retry", post(retry_job))
}
