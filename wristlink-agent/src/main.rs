//! WristLink Agent - smartwatch telemetry bridge
//!
//! Bridges a paired smartwatch to the telemetry backend:
//! - Line-protocol device link with identity recovery
//! - Monitoring mode fetched from the backend at session start
//! - Heart-rate readings and location samples posted upstream
//! - Haptic feedback commands relayed back to the watch

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{info, warn};

use wristlink_agent::backend::BackendClient;
use wristlink_agent::config::AgentConfig;
use wristlink_agent::orchestrator::Orchestrator;
use wristlink_agent::platform::tcp::TcpPlatform;
use wristlink_agent::retry::RetryPolicy;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "wristlink_agent=info".to_string()),
        )
        .init();

    info!("WristLink agent starting...");

    let config = AgentConfig::load().await.context("Failed to load configuration")?;
    info!(backend = %config.backend.base_url, "configuration loaded");

    let platform = Arc::new(TcpPlatform::from_config(&config));
    let backend = BackendClient::new(
        &config.backend.base_url,
        config.request_timeout(),
        RetryPolicy::unbounded(std::time::Duration::from_millis(
            config.retry.post_retry_delay_ms,
        )),
    )
    .context("Failed to create backend client")?;

    let (orchestrator, mut alerts) = Orchestrator::new(platform, backend, &config);
    let (stop_tx, stop_rx) = oneshot::channel();
    let session = tokio::spawn(orchestrator.run(stop_rx));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            alert = alerts.recv() => {
                match alert {
                    Some(alert) => warn!(?alert, "session requires attention"),
                    None => {
                        warn!("monitoring session ended");
                        break;
                    }
                }
            }
        }
    }

    let _ = stop_tx.send(());
    session.await.context("Monitoring session panicked")?;
    info!("WristLink agent stopped");
    Ok(())
}
