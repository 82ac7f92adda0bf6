//! Download inspection endpoints

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::internal_error;
use crate::app::AppState;
use crate::db::{DownloadRecord, HistoryRecord, ProcessingJobRecord};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct DownloadDetail {
    #[serde(flatten)]
    pub download: DownloadRecord,
    pub jobs: Vec<ProcessingJobRecord>,
    pub history: Vec<HistoryRecord>,
}

/// Most recently started downloads
async fn list_downloads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DownloadRecord>>, StatusCode> {
    state
        .db
        .downloads()
        .list(query.limit.clamp(1, 500))
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to list downloads", e))
}

/// One download with its jobs and history
async fn get_download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DownloadDetail>, StatusCode> {
    let download = state
        .db
        .downloads()
        .get(id)
        .await
        .map_err(|e| internal_error("Failed to load download", e))?
        .ok_or(StatusCode::NOT_FOUND)?;

    let jobs = state
        .db
        .processing_jobs()
        .list_for_download(id)
        .await
        .map_err(|e| internal_error("Failed to load jobs for download", e))?;
    let history = state
        .db
        .history()
        .list_for_download(id)
        .await
        .map_err(|e| internal_error("Failed to load history for download", e))?;

    Ok(Json(DownloadDetail {
        download,
        jobs,
        history,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/downloads", get(list_downloads))
        .route("/api/downloads/{id}", get(get_download))
}
