use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use detect_core::config::ServerConfig;
use detect_server::server::Server;

/// Multi-protocol object-detection serving gateway.
#[derive(Debug, Parser)]
#[command(name = "detect-server", version)]
struct Cli {
    /// Path to the server configuration file (JSON).
    #[arg(short = 'f', long = "config", default_value = "../config/config.json")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = ServerConfig::from_file(&cli.config)?;
    tracing::info!(
        protocol = ?config.protocol,
        ip = %config.ip,
        port = %config.port,
        engines = config.engines.len(),
        "loaded server configuration"
    );

    Server::new(config).run()
}
