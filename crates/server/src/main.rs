use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use convoy_server::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "convoyd")]
#[command(about = "Convoy agent server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "convoyd.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(short, long, env = "CONVOY_LISTEN")]
    listen: Option<String>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    write_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = ServerConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    if args.write_config {
        config.save(&args.config)?;
        info!("Configuration written to: {}", args.config.display());
        return Ok(());
    }

    info!("Starting convoyd v{}", convoy_common::VERSION);
    convoy_server::server::serve(config).await
}
