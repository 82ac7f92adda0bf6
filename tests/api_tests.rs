//! HTTP surface tests driven through the router without binding a socket

use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use librarian_ingest::db::{CreateDownload, CreateProcessingJob, Database};
use librarian_ingest::services::metrics::Metrics;
use librarian_ingest::services::{ServicesManager, TaskService};
use librarian_ingest::{AppState, Config, PipelineSettings, build_app};

async fn state_with(services: Arc<ServicesManager>) -> AppState {
    AppState {
        config: Arc::new(Config {
            port: 0,
            database_url: "sqlite::memory:".to_string(),
            pipeline: PipelineSettings::default(),
        }),
        db: Database::in_memory().await.unwrap(),
        services,
        metrics: Metrics::new(),
    }
}

async fn state() -> AppState {
    state_with(ServicesManager::builder().build().await.unwrap()).await
}

async fn send(state: &AppState, method: &str, uri: &str) -> (StatusCode, Value) {
    let response = build_app(state.clone())
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

async fn failed_job(state: &AppState) -> Uuid {
    let download = state
        .db
        .downloads()
        .create(CreateDownload {
            title: "The Left Hand of Darkness".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let job = state
        .db
        .processing_jobs()
        .try_create(CreateProcessingJob {
            download_id: download.id,
            source_path: "/downloads/The Left Hand of Darkness".to_string(),
            client_id: None,
            priority: 0,
            max_retries: 3,
        })
        .await
        .unwrap()
        .unwrap();
    state
        .db
        .processing_jobs()
        .mark_failed(job.id, "Source path does not exist")
        .await
        .unwrap();
    job.id
}

#[tokio::test]
async fn test_healthz() {
    let state = state().await;
    let (status, body) = send(&state, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_readyz_reports_exited_service() {
    let services = ServicesManager::builder()
        .add_service(Arc::new(TaskService::new("short_lived", |_cancel| async {})))
        .start()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let state = state_with(services).await;
    let (status, body) = send(&state, "GET", "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["database"], true);
    assert_eq!(body["ready"], false);
}

#[tokio::test]
async fn test_readyz_with_running_service() {
    let services = ServicesManager::builder()
        .add_service(Arc::new(TaskService::new("idle", |cancel| async move {
            cancel.cancelled().await;
        })))
        .start()
        .await
        .unwrap();

    let state = state_with(services.clone()).await;
    let (status, body) = send(&state, "GET", "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);

    services.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_job_stats_and_retry() {
    let state = state().await;
    let job_id = failed_job(&state).await;

    let (status, body) = send(&state, "GET", "/api/jobs/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failed"], 1);
    assert_eq!(body["queued"], 0);

    let (status, body) = send(&state, "POST", &format!("/api/jobs/{job_id}/retry")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    // Already queued again, so a second retry is a conflict
    let (status, body) = send(&state, "POST", &format!("/api/jobs/{job_id}/retry")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (_, body) = send(&state, "GET", "/api/jobs/stats").await;
    assert_eq!(body["queued"], 1);
    assert_eq!(body["failed"], 0);
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let state = state().await;
    let id = Uuid::new_v4();

    let (status, _) = send(&state, "POST", &format!("/api/jobs/{id}/retry")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&state, "GET", &format!("/api/jobs/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&state, "GET", &format!("/api/downloads/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_detail_includes_jobs() {
    let state = state().await;
    let job_id = failed_job(&state).await;

    let (status, list) = send(&state, "GET", "/api/downloads?limit=10").await;
    assert_eq!(status, StatusCode::OK);
    let downloads = list.as_array().unwrap();
    assert_eq!(downloads.len(), 1);
    let download_id = downloads[0]["id"].as_str().unwrap().to_string();

    let (status, detail) = send(&state, "GET", &format!("/api/downloads/{download_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["title"], "The Left Hand of Darkness");
    assert_eq!(detail["jobs"][0]["id"], job_id.to_string());
}
