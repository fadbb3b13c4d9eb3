// SPDX-License-Identifier: BUSL-1.1

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use odin_fanout::{run, FanoutConfig};

#[derive(Parser)]
#[command(name = "odin-fanout", about = "Real-time WebSocket fan-out server")]
struct Cli {
    #[command(flatten)]
    config: FanoutConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining connections");
        signal_shutdown.cancel();
    });

    run(cli.config, shutdown).await
}
