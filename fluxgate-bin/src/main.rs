use anyhow::{Context, Result};
use clap::Parser;
use fluxgate_core::{logging, Config, Worker};
use std::path::PathBuf;

/// Fluxgate - encrypted proxy client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short, long)]
    test_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logging();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    config
        .validate()
        .context("configuration validation failed")?;

    if args.test_config {
        println!("Configuration test passed!");
        return Ok(());
    }

    let worker = Worker::new(config)?;
    let port = worker.start().await?;
    tracing::info!("fluxgate listening on local port {}", port);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    tracing::info!("shutdown signal received");

    worker.stop().await?;
    Ok(())
}
