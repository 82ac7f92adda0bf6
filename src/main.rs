//! Librarian ingest service entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use librarian_ingest::services::ServicesManager;
use librarian_ingest::{AppState, Config, Database, Pipeline, build_app, jobs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "librarian_ingest=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Librarian ingest");
    let config = Arc::new(Config::from_env()?);
    info!(
        output = %config.pipeline.output_path.display(),
        action = %config.pipeline.completed_file_action,
        "Configuration loaded"
    );

    let db = Database::connect_with_retry(&config.database_url, Duration::from_secs(5)).await;
    info!("Database connected");

    let pipeline = Pipeline::from_database(db.clone(), config.pipeline.clone()).await?;
    info!(clients = pipeline.clients.len(), "Pipeline initialized");

    let mut builder = ServicesManager::builder();
    for service in pipeline.services() {
        builder = builder.add_service(service);
    }
    let services = builder.start().await?;

    let mut scheduler = jobs::start_scheduler(
        db.clone(),
        pipeline.extractor.clone(),
        config.pipeline.job_retention_days,
    )
    .await?;

    let state = AppState {
        config: config.clone(),
        db,
        services: services.clone(),
        metrics: pipeline.metrics.clone(),
    };
    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.stop_all().await?;
    scheduler.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}
