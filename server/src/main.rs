mod annotate;
mod ingest;
mod server;
mod store;
mod stream;
#[cfg(test)]
mod testutil;
mod validator;

use frame_relay_common::config::Config;
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        bind = config.server.bind,
        placeholder = config.server.placeholder_path,
        "starting frame-relay server"
    );

    if let Err(e) = server::serve(&config).await {
        error!(error = %e, "frame-relay server failed");
        std::process::exit(1);
    }
    info!("frame-relay server stopped");
}
