//! script-runner service
//!
//! Accepts TCP clients, authenticates them with a shared key and runs the
//! scripts they submit.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use script_runner::{config::Config, service::Service};

#[derive(Parser, Debug)]
#[command(name = "script-runner")]
#[command(about = "Remote script execution service for Lua, Python and JavaScript")]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Shared handshake key
    #[arg(long)]
    key: Option<String>,

    /// Worker pool size
    #[arg(long)]
    workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(key) = self.key {
            config.key = Some(key);
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);

    info!(
        address = %config.listen_address(),
        workers = config.workers,
        python = %config.python,
        "Loaded configuration"
    );

    let service = Arc::new(Service::new(config)?);
    let server = service.start().await?;
    info!(address = %server.local_addr(), "Service started");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    server.abort();

    tokio::task::spawn_blocking(move || service.shutdown())
        .await
        .context("Shutdown task failed")?;
    Ok(())
}
