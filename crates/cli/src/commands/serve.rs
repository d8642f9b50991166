use std::sync::Arc;

use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use trunchbull_api::AppState;
use trunchbull_core::sync::scheduler::SyncScheduler;

use super::{build_orchestrator, load_config, open_repository};

/// Run the `serve` command: HTTP API plus the periodic sync scheduler.
pub async fn run(config_path: &str, port: Option<u16>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let repo = open_repository(&config).await?;

    let orchestrator = Arc::new(build_orchestrator(repo.clone(), &config)?);
    orchestrator.recover_interrupted().await?;
    if orchestrator.sources().is_empty() {
        info!("No providers enabled; scheduled sync will be a no-op");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler =
        SyncScheduler::new(orchestrator.clone(), config.sync.interval()).spawn(shutdown_rx);

    let state = Arc::new(AppState::new(repo, orchestrator));
    let app = trunchbull_api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let port = port.unwrap_or(config.server.port);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    println!("Trunchbull listening on http://{}", addr);
    info!(env = %config.server.env, "Starting server on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send_replace(true);
    if let Err(e) = scheduler.await {
        error!("Sync scheduler task failed: {e}");
    }

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C handler: {e}");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
