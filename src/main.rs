//! Bepass relay - WebSocket to TCP tunneling relay.
//!
//! This is the main binary entry point. See the `bepass_relay` library for
//! the relay core.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bepass_relay::outbound::egress;
use bepass_relay::{server, Config, OutboundConnector, RelayEngine};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "bepass-relay")]
#[command(version)]
#[command(about = "WebSocket to TCP tunneling relay with fallback egress retry")]
struct Cli {
    /// Path to a JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default)
    Serve {
        /// Listen address, overrides the config file
        #[arg(long)]
        listen: Option<String>,
    },
    /// Print the effective configuration as JSON
    Config,
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("BEPASS_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

async fn run_server(mut config: Config, listen: Option<String>) -> Result<()> {
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    let fallback = egress::init(&config.fallback_egress)?;
    log::info!("Selected fallback egress {}", fallback);

    let capacity = config.remote_queue_capacity;
    let connector = OutboundConnector::tcp(fallback).with_capacity(capacity);
    let engine = RelayEngine::new(connector).with_replay_limit(config.replay_limit);

    server::serve(&config, Arc::new(engine)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve { listen: None }) {
        Commands::Serve { listen } => run_server(config, listen).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
