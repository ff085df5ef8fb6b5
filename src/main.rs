mod app;
mod config;
mod controls;
mod error;
mod ingress;
mod media;
mod messages;
mod ownership;
mod process;
mod services;
mod status;
#[cfg(all(test, unix))]
mod testutil;

use app::App;
use config::Config;
use status::ChannelPublisher;

use anyhow::Result;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries status lines
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting camctl camera control service");

    let config = Config::load()?;
    config.validate()?;

    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let stdin = BufReader::new(tokio::io::stdin());
        if let Err(e) = ingress::read_commands(stdin, inbound_tx).await {
            tracing::error!("Control input failed: {:#}", e);
        }
    });

    let (status_tx, status_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = ingress::write_statuses(status_rx, tokio::io::stdout()).await {
            tracing::error!("Status output failed: {:#}", e);
        }
    });

    let app = App::new(config, Arc::new(ChannelPublisher::new(status_tx)), inbound_rx).await?;
    app.run().await
}
