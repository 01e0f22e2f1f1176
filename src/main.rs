//! `sessiongate`: session broker server binary.
//!
//! Usage:
//!   sessiongate serve [--config <path>] [--host <host>] [--port <port>]
//!   sessiongate check-config [--config <path>]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sessiongate::Config;
use tracing::info;

/// Proxy-authenticated backend session broker.
#[derive(Parser, Debug)]
#[command(name = "sessiongate", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Path to the TOML config file.
        #[arg(short = 'c', long = "config", default_value = "sessiongate.toml")]
        config: PathBuf,

        /// Bind host (overrides `[gateway] host`).
        #[arg(long)]
        host: Option<String>,

        /// Bind port (overrides `[gateway] port`).
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the config file, then exit.
    CheckConfig {
        #[arg(short = 'c', long = "config", default_value = "sessiongate.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, host, port } => {
            info!("Loading configuration from {}", config.display());
            let config = Config::load(&config)?;
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            sessiongate::gateway::run_gateway(&host, port, config).await
        }
        Command::CheckConfig { config: path } => {
            let config = Config::load(&path)?;
            println!(
                "{} is valid: backend={:?}, gateway={}:{}, handoff ttl={}s",
                path.display(),
                config.backend.kind,
                config.gateway.host,
                config.gateway.port,
                config.handoff.ttl_secs,
            );
            Ok(())
        }
    }
}
