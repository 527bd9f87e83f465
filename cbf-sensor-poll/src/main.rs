//! CBF Sensor Poller - KATCP sensor snapshots for the CBF dashboard
//!
//! This binary:
//! - Loads `.env` and the poller configuration
//! - Discovers the running arrays behind the primary KATCP endpoint
//! - Writes `<instrument>.<array>.sensor_values.json` and
//!   `<instrument>.<array>.ordered_sensor_values.json` every poll interval
//! - Stops cleanly on Ctrl-C, closing every KATCP session

use anyhow::{Context, Result};
use cbf_sensor_poll::{HealthTracker, PollerConfig, Supervisor};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {e}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cbf_sensor_poll=info")))
        .init();

    info!("CBF sensor poller v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = PollerConfig::load().await.context("Failed to load configuration")?;
    info!(
        "KATCP endpoint {}, snapshots in {}",
        config.katcp,
        config.json_dumps_dir.display()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let health = HealthTracker::new();
    let mut supervisor = Supervisor::new(config, health.clone());
    supervisor.run(shutdown_rx).await.context("Poller execution failed")?;

    let summary = health.get_health();
    info!(
        "Stopped after {} poll cycles, last snapshot {}",
        summary.poll_cycles,
        summary
            .last_successful_write
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    Ok(())
}
