mod directory;
mod mjpeg;
mod relay;

use frame_relay_common::config::Config;
use relay::RelayLink;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("relay WebSocket error: {0}")]
    WebSocket(tokio_tungstenite::tungstenite::Error),
    #[error("relay unreachable, next attempt in {0:?}")]
    RelayBackoff(Duration),
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("no images found in {0}")]
    EmptyDirectory(String),
}

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

    let producer = &config.producer;
    info!(
        relay = producer.relay_url,
        mode = producer.mode,
        source = producer.source,
        fps = producer.fps,
        "starting frame-relay producer"
    );

    if producer.source.is_empty() {
        error!("producer.source is not set");
        std::process::exit(1);
    }
    if producer.fps.is_nan() || producer.fps <= 0.0 {
        error!(fps = producer.fps, "producer.fps must be positive");
        std::process::exit(1);
    }
    let interval = Duration::from_secs_f64(1.0 / producer.fps);

    let mut link = RelayLink::new(producer.relay_url.clone());

    let result = tokio::select! {
        result = run(producer.mode.as_str(), &producer.source, &mut link, interval) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    };
    link.close().await;

    if let Err(e) = result {
        error!(error = %e, "producer stopped");
        std::process::exit(1);
    }
}

async fn run(
    mode: &str,
    source: &str,
    link: &mut RelayLink,
    interval: Duration,
) -> Result<(), ProducerError> {
    match mode {
        "mjpeg" => {
            mjpeg::run_mjpeg_producer(source, link).await;
            Ok(())
        }
        "polling" => {
            mjpeg::run_polling_producer(source, link, interval).await;
            Ok(())
        }
        "directory" => directory::run_directory_producer(Path::new(source), link, interval).await,
        other => {
            error!(mode = other, "unknown producer mode, expected 'mjpeg', 'polling' or 'directory'");
            std::process::exit(1);
        }
    }
}
