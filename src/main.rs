//! healthwatch - self-healing health check daemon
//!
//! Periodically probes the subsystems of a container-orchestrated fleet and
//! performs bounded remediation when a degradation threshold is crossed.

#![allow(missing_docs)]

use healthwatch::config::Config;
use healthwatch::Daemon;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging system
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    // Load config (file when present, then environment overrides)
    let path = std::env::var("HEALTHWATCH_CONFIG")
        .unwrap_or_else(|_| "config/healthwatch.yaml".to_string());
    let config = Config::load(&path).await?;

    Daemon::new(config).await?.run().await.map_err(|e| e.into())
}
