//! `agentic-osd` — boot the runtime and serve the gateway.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use agentic_os::{
    bootstrap::AppBootstrap,
    config::{load_config, load_default_config},
    error::Result,
};

#[derive(Debug, Parser)]
#[command(name = "agentic-osd", about = "Multi-agent runtime daemon")]
struct Args {
    /// Config file path (default: ~/.agentic-os/config.toml, or
    /// AGENTIC_OS_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the gateway bind address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => load_default_config(),
    };
    if let Some(bind) = args.bind {
        config.gateway.bind_addr = bind;
    }

    // Provider adaptors are linked by embedding applications; a bare daemon
    // still serves health, ingress, and federation.
    let runtime = AppBootstrap::new(config).build().await?;
    let addr = runtime.start().await?;
    tracing::info!("gateway ready on {addr}");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
