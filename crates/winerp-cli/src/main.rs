//! winerp relay binary.

mod cli;
mod config;

use clap::Parser;
use cli::Cli;
use tracing::info;
use winerp_server::Server;

fn init_tracing_stderr(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr(cli.log_level.as_deref());

    let config = config::load_config(cli.config.as_deref());
    let config = config::apply_overrides(config, cli.host, cli.port);

    let (server, accept) = Server::start(config).await?;
    info!(uri = %server.uri(), "winerp relay started (Ctrl+C to stop)");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
        _ = accept => {}
    }
    Ok(())
}
