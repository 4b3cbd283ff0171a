use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use frame_relay_common::config::StreamConfig;
use frame_relay_common::frame::Frame;
use frame_relay_common::multipart;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::annotate::{annotate_or_passthrough, Annotator};
use crate::store::FrameStore;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("viewer connection closed")]
    ViewerGone,
    #[error("failed to encode frame: {0}")]
    Encode(String),
    #[error("render task failed: {0}")]
    TaskJoin(String),
}

/// Where a stream session writes its multipart chunks.
pub trait ChunkSink: Send {
    /// Deliver one chunk. An error means the viewer is gone for good.
    fn send_chunk(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), StreamError>> + Send;
}

/// The channel feeding an HTTP response body; the receiver is dropped when
/// the viewer disconnects.
impl ChunkSink for mpsc::Sender<Result<Bytes, Infallible>> {
    async fn send_chunk(&mut self, chunk: Bytes) -> Result<(), StreamError> {
        self.send(Ok(chunk)).await.map_err(|_| StreamError::ViewerGone)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub pacing: Duration,
    pub jpeg_quality: u8,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            pacing: Duration::from_millis(config.pacing_interval_ms),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// Encode a frame for the wire: annotate (if configured), JPEG-encode and
/// wrap in one multipart part. Always re-encodes, whatever format the frame
/// arrived in.
pub fn render_chunk(
    frame: &Frame,
    annotator: Option<&dyn Annotator>,
    jpeg_quality: u8,
) -> Result<Bytes, StreamError> {
    let image = annotate_or_passthrough(annotator, frame.image());
    let jpeg = encode_jpeg(&image, jpeg_quality)?;
    Ok(multipart::encode_part(&jpeg))
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, StreamError> {
    let rgb = image.to_rgb8();
    let mut buf = Vec::with_capacity(rgb.as_raw().len() / 8);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
        .map_err(|e| StreamError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Per-viewer loop: read the store, emit one chunk, sleep, repeat.
///
/// Sessions share nothing but the store. Each keeps the last chunk it
/// rendered and reuses it while the store still hands out the same frame.
pub struct StreamSession {
    id: u64,
    store: Arc<FrameStore>,
    annotator: Option<Arc<dyn Annotator>>,
    settings: StreamSettings,
    shutdown: CancellationToken,
    last_rendered: Option<(Arc<Frame>, Bytes)>,
}

impl StreamSession {
    pub fn new(
        id: u64,
        store: Arc<FrameStore>,
        annotator: Option<Arc<dyn Annotator>>,
        settings: StreamSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            store,
            annotator,
            settings,
            shutdown,
            last_rendered: None,
        }
    }

    /// Emit frames until the viewer goes away or the server shuts down.
    /// Returns the number of chunks delivered.
    pub async fn run<S: ChunkSink>(mut self, mut sink: S) -> u64 {
        let shutdown = self.shutdown.clone();
        let mut emitted: u64 = 0;
        info!(session = self.id, "viewer connected");

        loop {
            let delivered = tokio::select! {
                _ = shutdown.cancelled() => break,
                delivered = self.emit_once(&mut sink) => delivered,
            };
            match delivered {
                Ok(true) => emitted += 1,
                Ok(false) => {}
                Err(StreamError::ViewerGone) => break,
                Err(e) => warn!(session = self.id, error = %e, "frame not sent, retrying next tick"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.pacing) => {}
            }
        }

        info!(session = self.id, emitted, "viewer disconnected");
        emitted
    }

    /// One iteration. `Ok(false)` when there is nothing to show yet.
    async fn emit_once<S: ChunkSink>(&mut self, sink: &mut S) -> Result<bool, StreamError> {
        let Some(chunk) = self.next_chunk().await? else {
            return Ok(false);
        };
        sink.send_chunk(chunk).await?;
        Ok(true)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        let snapshot = self.store.read();
        let Some(frame) = snapshot.frame() else {
            return Ok(None);
        };

        if let Some((rendered, chunk)) = &self.last_rendered {
            if Arc::ptr_eq(rendered, frame) {
                return Ok(Some(chunk.clone()));
            }
        }

        let frame = Arc::clone(frame);
        let to_render = Arc::clone(&frame);
        let annotator = self.annotator.clone();
        let quality = self.settings.jpeg_quality;
        let chunk = tokio::task::spawn_blocking(move || {
            render_chunk(&to_render, annotator.as_deref(), quality)
        })
        .await
        .map_err(|e| StreamError::TaskJoin(e.to_string()))??;

        debug!(
            session = self.id,
            seq = frame.seq,
            live = snapshot.is_live(),
            bytes = chunk.len(),
            "rendered new frame"
        );
        self.last_rendered = Some((frame, chunk.clone()));
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::AnnotateError;
    use crate::testutil::noisy_jpeg;
    use crate::validator::decode_image;

    const PART_PREFIX: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

    fn store_with(jpeg: Option<&Bytes>, placeholder: Option<&Bytes>) -> Arc<FrameStore> {
        let placeholder = placeholder.map(|bytes| {
            Frame::new(bytes.clone(), decode_image(bytes).unwrap(), 0, 0)
        });
        let store = FrameStore::new(placeholder);
        if let Some(bytes) = jpeg {
            store.write(bytes.clone(), decode_image(bytes).unwrap());
        }
        Arc::new(store)
    }

    fn fast() -> StreamSettings {
        StreamSettings {
            pacing: Duration::from_millis(10),
            jpeg_quality: 80,
        }
    }

    fn spawn_session(
        store: &Arc<FrameStore>,
        annotator: Option<Arc<dyn Annotator>>,
        shutdown: &CancellationToken,
    ) -> (
        mpsc::Receiver<Result<Bytes, Infallible>>,
        tokio::task::JoinHandle<u64>,
    ) {
        let (tx, rx) = mpsc::channel(1);
        let session = StreamSession::new(1, Arc::clone(store), annotator, fast(), shutdown.clone());
        (rx, tokio::spawn(session.run(tx)))
    }

    async fn next_part(rx: &mut mpsc::Receiver<Result<Bytes, Infallible>>) -> Bytes {
        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("chunk within timeout")
            .expect("session still running");
        match chunk {
            Ok(bytes) => bytes,
            Err(never) => match never {},
        }
    }

    /// Strip the multipart framing and decode the JPEG body.
    fn body_dimensions(chunk: &[u8]) -> (u32, u32) {
        assert!(chunk.starts_with(PART_PREFIX));
        assert!(chunk.ends_with(b"\r\n"));
        let body = &chunk[PART_PREFIX.len()..chunk.len() - 2];
        let image = decode_image(body).unwrap();
        (image.width(), image.height())
    }

    #[test]
    fn render_always_produces_framed_jpeg() {
        let png = {
            let mut buf = std::io::Cursor::new(Vec::new());
            DynamicImage::new_rgba8(24, 16)
                .write_to(&mut buf, image::ImageFormat::Png)
                .unwrap();
            Bytes::from(buf.into_inner())
        };
        let frame = Frame::new(png.clone(), decode_image(&png).unwrap(), 0, 0);

        let chunk = render_chunk(&frame, None, 80).unwrap();
        assert_eq!(&chunk[PART_PREFIX.len()..PART_PREFIX.len() + 2], &[0xFF, 0xD8]);
        assert_eq!(body_dimensions(&chunk), (24, 16));
    }

    #[tokio::test]
    async fn live_frame_is_streamed_as_multipart_chunks() {
        let store = store_with(Some(&noisy_jpeg(128, 96, 1)), None);
        let shutdown = CancellationToken::new();
        let (mut rx, handle) = spawn_session(&store, None, &shutdown);

        let first = next_part(&mut rx).await;
        let second = next_part(&mut rx).await;
        assert_eq!(body_dimensions(&first), (128, 96));
        // unchanged frame, same rendered chunk
        assert_eq!(first, second);

        shutdown.cancel();
        let emitted = handle.await.unwrap();
        assert!(emitted >= 2);
    }

    #[tokio::test]
    async fn placeholder_is_streamed_before_first_frame() {
        let store = store_with(None, Some(&noisy_jpeg(40, 30, 2)));
        let shutdown = CancellationToken::new();
        let (mut rx, _handle) = spawn_session(&store, None, &shutdown);

        assert_eq!(body_dimensions(&next_part(&mut rx).await), (40, 30));

        let live = noisy_jpeg(128, 128, 3);
        store.write(live.clone(), decode_image(&live).unwrap());
        // placeholder chunks rendered before the write may still be in flight
        let mut seen = body_dimensions(&next_part(&mut rx).await);
        for _ in 0..3 {
            if seen == (128, 128) {
                break;
            }
            seen = body_dimensions(&next_part(&mut rx).await);
        }
        assert_eq!(seen, (128, 128));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn nothing_is_emitted_without_any_frame() {
        let store = store_with(None, None);
        let shutdown = CancellationToken::new();
        let (mut rx, handle) = spawn_session(&store, None, &shutdown);

        let waited = tokio::time::timeout(Duration::from_millis(150), rx.recv()).await;
        assert!(waited.is_err(), "no chunk may be sent while the store is empty");

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn session_ends_when_viewer_disconnects() {
        let store = store_with(Some(&noisy_jpeg(128, 128, 4)), None);
        let shutdown = CancellationToken::new();
        let (mut rx, handle) = spawn_session(&store, None, &shutdown);

        next_part(&mut rx).await;
        drop(rx);

        let emitted = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session should notice the closed viewer")
            .unwrap();
        assert!(emitted >= 1);
        // the store is unaffected
        assert_eq!(store.current().unwrap().seq, 1);
    }

    #[tokio::test]
    async fn annotation_failure_still_streams_frame() {
        struct Broken;
        impl Annotator for Broken {
            fn annotate(&self, _image: &DynamicImage) -> Result<DynamicImage, AnnotateError> {
                Err(AnnotateError::Model("out of memory".into()))
            }
        }

        let store = store_with(Some(&noisy_jpeg(128, 96, 5)), None);
        let shutdown = CancellationToken::new();
        let (mut rx, _handle) = spawn_session(&store, Some(Arc::new(Broken)), &shutdown);

        assert_eq!(body_dimensions(&next_part(&mut rx).await), (128, 96));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn panicking_annotator_still_streams_frame() {
        struct Panicking;
        impl Annotator for Panicking {
            fn annotate(&self, _image: &DynamicImage) -> Result<DynamicImage, AnnotateError> {
                panic!("model runtime crashed");
            }
        }

        let store = store_with(Some(&noisy_jpeg(128, 96, 7)), None);
        let shutdown = CancellationToken::new();
        let (mut rx, _handle) = spawn_session(&store, Some(Arc::new(Panicking)), &shutdown);

        assert_eq!(body_dimensions(&next_part(&mut rx).await), (128, 96));
        assert_eq!(body_dimensions(&next_part(&mut rx).await), (128, 96));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn sessions_poll_independently() {
        let store = store_with(Some(&noisy_jpeg(128, 96, 6)), None);
        let shutdown = CancellationToken::new();

        let (mut rx_a, _a) = spawn_session(&store, None, &shutdown);
        assert_eq!(body_dimensions(&next_part(&mut rx_a).await), (128, 96));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let newer = noisy_jpeg(160, 120, 7);
        store.write(newer.clone(), decode_image(&newer).unwrap());

        // a viewer joining now sees the frame current at its own first poll
        let (mut rx_b, _b) = spawn_session(&store, None, &shutdown);
        assert_eq!(body_dimensions(&next_part(&mut rx_b).await), (160, 120));

        // and the first viewer catches up on its own schedule
        let mut seen = body_dimensions(&next_part(&mut rx_a).await);
        for _ in 0..3 {
            if seen == (160, 120) {
                break;
            }
            seen = body_dimensions(&next_part(&mut rx_a).await);
        }
        assert_eq!(seen, (160, 120));
        shutdown.cancel();
    }

    #[test]
    fn settings_follow_config() {
        let settings = StreamSettings::from(&StreamConfig {
            pacing_interval_ms: 250,
            jpeg_quality: 0,
        });
        assert_eq!(settings.pacing, Duration::from_millis(250));
        assert_eq!(settings.jpeg_quality, 1);
        assert_eq!(StreamSettings::default().pacing, Duration::from_millis(100));
    }
}
