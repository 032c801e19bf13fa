use anyhow::Result;
use metrix_server::config::ServerConfig;
use metrix_server::health::run_health_checks;
use metrix_storage::{open_collector, Context};
use tokio::signal;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("metrix=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/server.toml".to_string());
    let config = ServerConfig::load(&config_path)?;
    tracing::info!(config = %config_path, "metrix-server starting");

    let root = Context::background();
    let collector = open_collector(&root, &config.storage).await?;

    let health_handle = if config.health_check_interval_secs > 0 {
        Some(tokio::spawn(run_health_checks(
            root.with_cancel(),
            collector.clone(),
            Duration::from_secs(config.health_check_interval_secs),
        )))
    } else {
        None
    };

    tracing::info!("Server started");
    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");

    root.cancel();
    if let Some(h) = health_handle {
        if let Err(e) = h.await {
            tracing::warn!(error = %e, "Health check task ended abnormally");
        }
    }
    if let Err(e) = collector.close().await {
        tracing::error!(error = %e, "Failed to close metric storage");
    }
    tracing::info!("Server stopped");

    Ok(())
}
