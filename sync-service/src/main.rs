//! `huddle-sync` entry point.

use clap::Parser;
use huddle_sync_service::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log_filter))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("huddle-sync v{} starting", env!("CARGO_PKG_VERSION"));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    huddle_sync_service::run(&cli, &config, shutdown_rx).await?;

    tracing::info!("huddle-sync exiting cleanly");
    Ok(())
}
