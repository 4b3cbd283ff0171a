use frame_relay_common::multipart::MultipartParser;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::relay::RelayLink;
use crate::ProducerError;

/// Consume the camera's MJPEG stream and forward every frame to the relay.
/// Reconnects with exponential backoff on failure.
pub async fn run_mjpeg_producer(stream_url: &str, link: &mut RelayLink) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, link).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(url: &str, link: &mut RelayLink) -> Result<(), ProducerError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(ProducerError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(ProducerError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(ProducerError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MultipartParser::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProducerError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            link.forward_or_drop(jpeg).await;
        }
    }

    Ok(())
}

/// Polling-based fallback: periodically fetch single frames.
pub async fn run_polling_producer(frame_url: &str, link: &mut RelayLink, interval: Duration) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match client.get(frame_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(jpeg) => link.forward_or_drop(jpeg).await,
                Err(e) => warn!(error = %e, "failed to read camera frame body"),
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "non-success response from camera");
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
            }
        }
    }
}
