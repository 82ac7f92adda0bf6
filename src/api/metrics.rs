//! Pipeline counters

use std::collections::BTreeMap;

use axum::{Json, Router, extract::State, routing::get};

use crate::app::AppState;

async fn snapshot(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.metrics.snapshot())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/metrics", get(snapshot))
}
