use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (TETHER_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("TETHER_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("tether_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = tether_server::config::ServerConfig::parse();
    tracing::info!("Starting tether, accounts from {}", config.accounts.display());
    if let Some(ref dir) = config.scripts_dir {
        tracing::info!("Scripts in {}", dir.display());
    }
    let server = tether_server::server::Server::new(config);
    server.run().await
}
