//! Import history endpoint

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;

use super::internal_error;
use crate::app::AppState;
use crate::db::{HistoryEventType, HistoryRecord};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub event_type: Option<String>,
    pub limit: Option<i64>,
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryRecord>>, StatusCode> {
    let event_type = match query.event_type.as_deref() {
        Some(value) => Some(
            value
                .parse::<HistoryEventType>()
                .map_err(|_| StatusCode::BAD_REQUEST)?,
        ),
        None => None,
    };

    state
        .db
        .history()
        .list(event_type, query.limit.unwrap_or(100).clamp(1, 500))
        .await
        .map(Json)
        .map_err(|e| internal_error("Failed to list history", e))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/history", get(list_history))
}
