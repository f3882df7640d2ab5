//! toolgate - Main entry point.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use toolgate::config::Config;
use toolgate::Gateway;

#[derive(Debug, Parser)]
#[command(name = "toolgate", version, about = "Federated MCP tool-execution gateway")]
struct Cli {
    /// Directory for durable state (overrides TOOLGATE_DATA_DIR).
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ~/.toolgate/.env and ./.env are optional.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::resolve()?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let gateway = Gateway::start(config).await?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "toolgate ready; attach a gateway surface to the dispatcher"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    gateway.shutdown().await;
    Ok(())
}
