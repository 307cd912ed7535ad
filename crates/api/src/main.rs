use std::sync::Arc;

use anyhow::Context;

use taskforge_ai::ExecutorRegistry;
use taskforge_api::app::{self, services};
use taskforge_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = ApiConfig::from_env().context("reading configuration")?;
    let backends = services::connect_backends(&config).await?;

    let registry = Arc::new(ExecutorRegistry::simulated(config.engine.executor_latency));
    tracing::info!(executors = ?registry, "executor registry ready");
    let background = services::start_background(&config.engine, &backends, registry);

    let app = app::build_app(Arc::new(services::AppServices::new(&backends)));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("draining background workers");
    background.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
