use std::sync::Arc;

use anyhow::{Context, Result};
use facematch_core::{FaceService, OnnxExtractor, TempSweeper};
use facematchd::{router, AppState, CleanupDaemon, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematchd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        bind = %config.bind,
        known_faces = %config.known_faces_dir.display(),
        temp = %config.temp_dir.display(),
        tolerance = config.tolerance,
        "configuration loaded"
    );

    let extractor = OnnxExtractor::load(&config.model_dir).with_context(|| {
        format!(
            "failed to load face models from {}",
            config.model_dir.display()
        )
    })?;
    let service = FaceService::new(config.service_settings(), Arc::new(extractor))
        .context("failed to open storage directories")?;

    let cleanup = CleanupDaemon::new(
        TempSweeper::new(service.uploads().dir(), config.retention),
        config.cleanup_interval,
    )
    .spawn();

    let app = router(
        AppState {
            service: Arc::new(service),
        },
        config.max_upload_bytes,
    );

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %config.bind, "facematchd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facematchd shutting down");
    cleanup.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
