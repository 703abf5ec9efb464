use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use rempl_bridge::config::{FileConfig, RelayConfig, default_config_dir};
use rempl_bridge::relay::{self, HubHandle};

#[derive(Parser)]
#[command(name = "rempl-bridge")]
#[command(about = "Relay between rempl publishers in a page and an inspector panel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config directory holding rempl.toml (defaults to ~/.config/rempl)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay hub WebSocket server in the foreground
    Serve(ServeArgs),
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser)]
struct ServeArgs {
    /// Host to bind to (overrides relay.host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (overrides relay.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "rempl_bridge=debug,tower_http=debug,info"
    } else {
        "rempl_bridge=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_dir = cli.config_dir.unwrap_or_else(default_config_dir);
    let mut file_config = FileConfig::load(&config_dir)?;

    match cli.command {
        Commands::Serve(args) => {
            if let Some(host) = args.host {
                file_config.relay.host = host;
            }
            if let Some(port) = args.port {
                file_config.relay.port = port;
            }
            let relay_config = RelayConfig::from_file(&file_config.relay)?;

            info!("Starting rempl relay hub");
            relay::serve(relay_config, HubHandle::spawn()).await
        }
        Commands::Config => {
            let rendered =
                toml::to_string_pretty(&file_config).context("Failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
    }
}
