use std::path::PathBuf;

use tick_pipeline::api::create_router;
use tick_pipeline::{Pipeline, PipelineConfig};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::resolve(std::env::args_os().nth(1).map(PathBuf::from))?;
    tracing::info!(
        version = tick_pipeline::SERVICE_VERSION,
        storage_root = %config.storage.root.display(),
        "Starting tick pipeline"
    );

    let pipeline = Pipeline::new(config.clone())?;
    pipeline.start().await?;

    if config.api.enabled {
        let listener = TcpListener::bind(&config.api.bind_addr).await?;
        tracing::info!("Listening on {}", config.api.bind_addr);
        axum::serve(listener, create_router(pipeline.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    pipeline.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
