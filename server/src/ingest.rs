use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::Message;
use bytes::Bytes;
use frame_relay_common::frame::Frame;
use futures_util::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::FrameStore;
use crate::validator::{FrameValidator, RejectReason, ValidationResult};

/// One message from the producer, independent of the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestMessage {
    /// Raw encoded image bytes.
    Binary(Bytes),
    /// Out-of-band diagnostics, never stored.
    Text(String),
    /// Transport keepalive (ping/pong).
    Control,
    Close,
}

impl From<Message> for IngestMessage {
    fn from(message: Message) -> Self {
        match message {
            Message::Binary(data) => IngestMessage::Binary(Bytes::from(data)),
            Message::Text(text) => IngestMessage::Text(text),
            Message::Ping(_) | Message::Pong(_) => IngestMessage::Control,
            Message::Close(_) => IngestMessage::Close,
        }
    }
}

/// Counters reported when an ingest connection closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub accepted: u64,
    pub too_small: u64,
    pub decode_failures: u64,
    pub text_messages: u64,
}

/// Validate one payload and, if it is a usable image, make it the current
/// frame. On rejection the store is left untouched.
///
/// Decoding is CPU-bound; async callers run this on the blocking pool.
pub fn accept_payload(
    validator: &FrameValidator,
    store: &FrameStore,
    data: Bytes,
) -> Result<Arc<Frame>, RejectReason> {
    match validator.validate(&data) {
        ValidationResult::Accepted(image) => Ok(store.write(data, image)),
        ValidationResult::Rejected(reason) => Err(reason),
    }
}

/// Per-connection loop for the producer side.
///
/// Nothing is ever sent back: bad payloads are dropped, and closing the
/// connection leaves the last good frame in place for viewers.
pub struct IngestSession {
    id: u64,
    store: Arc<FrameStore>,
    validator: FrameValidator,
    shutdown: CancellationToken,
    stats: IngestStats,
}

impl IngestSession {
    pub fn new(
        id: u64,
        store: Arc<FrameStore>,
        validator: FrameValidator,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            validator,
            shutdown,
            stats: IngestStats::default(),
        }
    }

    /// Consume messages until the producer disconnects, the transport fails,
    /// or the server shuts down.
    pub async fn run<S, E>(mut self, messages: S) -> IngestStats
    where
        S: Stream<Item = Result<IngestMessage, E>>,
        E: Display,
    {
        let mut messages = std::pin::pin!(messages);
        let shutdown = self.shutdown.clone();
        info!(
            session = self.id,
            min_frame_bytes = self.validator.min_frame_bytes(),
            "producer connected"
        );

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(session = self.id, "server shutting down, closing ingest session");
                    break;
                }
                next = messages.next() => next,
            };

            match next {
                Some(Ok(IngestMessage::Binary(data))) => self.handle_binary(data).await,
                Some(Ok(IngestMessage::Text(text))) => {
                    self.stats.text_messages += 1;
                    info!(session = self.id, text = %text, "text message from producer");
                }
                Some(Ok(IngestMessage::Control)) => {}
                Some(Ok(IngestMessage::Close)) => {
                    info!(session = self.id, "producer closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(session = self.id, error = %e, "ingest transport error");
                    break;
                }
                None => {
                    info!(session = self.id, "producer disconnected");
                    break;
                }
            }
        }

        let stats = self.stats;
        info!(
            session = self.id,
            accepted = stats.accepted,
            too_small = stats.too_small,
            decode_failures = stats.decode_failures,
            text_messages = stats.text_messages,
            "ingest session closed"
        );
        stats
    }

    async fn handle_binary(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let len = data.len();
        let store = Arc::clone(&self.store);
        let validator = self.validator;
        let result =
            tokio::task::spawn_blocking(move || accept_payload(&validator, &store, data)).await;

        match result {
            Ok(Ok(frame)) => {
                self.stats.accepted += 1;
                let (width, height) = frame.dimensions();
                debug!(
                    session = self.id,
                    seq = frame.seq,
                    bytes = len,
                    width,
                    height,
                    received_at = %frame.received_at(),
                    "frame accepted"
                );
                if self.stats.accepted % 100 == 0 {
                    debug!(session = self.id, total = self.stats.accepted, "frames accepted");
                }
            }
            Ok(Err(RejectReason::TooSmall { .. })) => {
                self.stats.too_small += 1;
                debug!(session = self.id, bytes = len, "payload below minimum size, ignored");
            }
            Ok(Err(reason)) => {
                self.stats.decode_failures += 1;
                warn!(session = self.id, bytes = len, error = %reason, "invalid frame dropped");
            }
            Err(e) => {
                warn!(session = self.id, error = %e, "frame validation task failed");
            }
        }
    }
}
