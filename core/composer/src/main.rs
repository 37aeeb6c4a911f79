use anyhow::{Context, Result};
use deal_memory_composer::{router, KnowledgeEngine};
use deal_memory_ingestion::EngineConfig;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Deal Memory Service v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();
    info!(
        "Fact store: {}, fast-path index: {}, pipeline {}",
        config.db_path, config.fast_path_db_path, config.pipeline_version
    );
    let bind_addr = config.bind_addr.clone();

    let (engine, worker) = KnowledgeEngine::open(config).context("opening knowledge engine")?;
    let engine = Arc::new(engine);

    tokio::spawn(worker.run());
    match engine.resume_pending().await {
        Ok(0) => {}
        Ok(count) => info!("Re-queued {} extraction jobs from the previous run", count),
        Err(e) => warn!("Could not resume pending extraction jobs: {}", e),
    }

    let app = router(engine);

    info!("Starting HTTP server on http://{}", bind_addr);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
