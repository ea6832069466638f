use anyhow::{Context, Result};
use conduit::{telemetry, Engine};
use conduit_core::EngineConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration: defaults, CONDUIT_CONFIG file, then environment
    let config = EngineConfig::load().context("Failed to load configuration")?;

    telemetry::init(&config)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize logging")?;

    let engine = Engine::build(config)
        .await
        .context("Failed to build engine")?;
    engine.start().await.context("Failed to start engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    engine.shutdown().await;
    Ok(())
}
