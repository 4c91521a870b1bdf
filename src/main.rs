use anyhow::Result;
use chain_tunnel::cli::{Cli, Commands};
use chain_tunnel::config::ServerConfig;
use chain_tunnel::server;
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_level.as_str())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Chain Tunnel v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Server { config } => {
            info!("Loading server configuration from: {}", config);
            let server_config = ServerConfig::load(config)?;
            server::run_server(server_config).await?;
        }
        Commands::Check { config } => {
            ServerConfig::load(config)?;
            println!("Configuration '{}' is valid", config);
        }
    }

    Ok(())
}
