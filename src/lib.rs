pub mod archive;
pub mod classifier;
pub mod config;
pub mod error;
pub mod forward;
pub mod health;
pub mod http;
pub mod ledger;
pub mod mail;
pub mod notify;
pub mod pipeline;
pub mod routing;
pub mod smtp;

use std::sync::Arc;

use acton_reactive::prelude::*;
use anyhow::Result;
use log::{error, info};

pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            return Err(e);
        }
    };

    http::install_crypto_provider();
    let pipeline = Arc::new(pipeline::Pipeline::from_config(&config).await?);

    let mut runtime = ActonApp::launch_async().await;

    let ledger_handle = ledger::LedgerState::create(&mut runtime).await?;
    let _smtp_handle =
        smtp::SmtpListenerState::create(&mut runtime, &config, pipeline, ledger_handle).await?;
    let _health_handle = health::HealthState::create(&mut runtime, &config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining in-flight work...");

    // Cancels the accept loops, then lets the ledger log its totals.
    runtime.shutdown_all().await?;
    info!("Shutdown complete");

    Ok(())
}
