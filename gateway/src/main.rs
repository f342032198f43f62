//! relay-gateway
//!
//! SSH gateway that authenticates clients and relays their sessions,
//! channels and port forwards to a configured upstream server.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use relay_gateway::config::GatewayConfig;

/// relay-gateway - relays SSH sessions to upstream servers
#[derive(Parser, Debug)]
#[command(name = "relay-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/relay-gateway/gateway.toml")]
    config: PathBuf,

    /// Write a starter configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Address to listen on instead of the configured one
    #[arg(short, long)]
    listen: Option<String>,

    /// Log at debug level, ignoring RUST_LOG
    #[arg(short, long)]
    verbose: bool,
}

fn log_filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new(Level::DEBUG.to_string());
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .with_target(false)
        .init();

    if cli.generate_config {
        GatewayConfig::create(&cli.config)?;
        info!("Wrote starter configuration to {}", cli.config.display());
        return Ok(());
    }

    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    config.ensure_dirs()?;

    info!(
        listen = %config.listen_addr,
        upstreams = config.upstreams.len(),
        on_open_failure = ?config.relay.on_open_failure,
        "Starting relay-gateway"
    );

    tokio::select! {
        result = relay_gateway::ssh::run_server(Arc::new(config)) => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, closing all connections"),
    }

    Ok(())
}
