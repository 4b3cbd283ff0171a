use bytes::Bytes;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::ProducerError;

static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Lazily connected WebSocket link to the relay's ingest endpoint.
///
/// Frames captured while the relay is unreachable are dropped rather than
/// queued, the relay only ever shows the newest frame anyway. Reconnects
/// back off exponentially from 2 s up to 30 s.
pub struct RelayLink {
    url: String,
    socket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    backoff: Duration,
    retry_at: Option<Instant>,
}

impl RelayLink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            socket: None,
            backoff: INITIAL_BACKOFF,
            retry_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Send one encoded frame as a binary message.
    pub async fn forward(&mut self, jpeg: Bytes) -> Result<(), ProducerError> {
        if !self.is_connected() {
            self.connect().await?;
        }
        let Some(socket) = self.socket.as_mut() else {
            return Err(ProducerError::RelayBackoff(self.backoff));
        };

        if let Err(e) = socket.send(Message::Binary(jpeg.to_vec())).await {
            self.socket = None;
            self.schedule_retry();
            return Err(ProducerError::WebSocket(e));
        }
        Ok(())
    }

    /// Forward a frame and log, rather than return, any failure.
    pub async fn forward_or_drop(&mut self, jpeg: Bytes) {
        let seq = SEQ_COUNTER.fetch_add(1, Ordering::Relaxed);
        let bytes = jpeg.len();
        match self.forward(jpeg).await {
            Ok(()) => debug!(seq, bytes, "frame forwarded to relay"),
            Err(e @ ProducerError::RelayBackoff(_)) => debug!(seq, error = %e, "frame dropped"),
            Err(e) => warn!(seq, error = %e, "failed to forward frame to relay"),
        }
    }

    /// Close the link politely, if open.
    pub async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                debug!(error = %e, "relay close handshake failed");
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ProducerError> {
        if let Some(retry_at) = self.retry_at {
            let now = Instant::now();
            if now < retry_at {
                return Err(ProducerError::RelayBackoff(retry_at - now));
            }
        }

        info!(url = self.url, "connecting to relay");
        match connect_async(self.url.as_str()).await {
            Ok((socket, response)) => {
                info!(url = self.url, status = %response.status(), "connected to relay");
                self.socket = Some(socket);
                self.backoff = INITIAL_BACKOFF;
                self.retry_at = None;
                Ok(())
            }
            Err(e) => {
                self.schedule_retry();
                Err(ProducerError::WebSocket(e))
            }
        }
    }

    fn schedule_retry(&mut self) {
        warn!(url = self.url, "relay unavailable, reconnecting in {:?}", self.backoff);
        self.retry_at = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
    }
}
