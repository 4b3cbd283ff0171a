use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use chrono::Utc;
use frame_relay_common::frame::Frame;
use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::validator::decode_image;

/// What a viewer should show right now.
#[derive(Debug, Clone)]
pub enum Snapshot {
    /// The most recent frame accepted from the producer.
    Live(Arc<Frame>),
    /// No live frame yet; the static fallback image.
    Placeholder(Arc<Frame>),
    /// Neither a live frame nor a placeholder exists.
    NoFrame,
}

impl Snapshot {
    pub fn frame(&self) -> Option<&Arc<Frame>> {
        match self {
            Snapshot::Live(frame) | Snapshot::Placeholder(frame) => Some(frame),
            Snapshot::NoFrame => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Snapshot::Live(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlaceholderError {
    #[error("failed to read placeholder {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to decode placeholder {0}: {1}")]
    Decode(PathBuf, String),
}

/// The single shared slot between the ingest side and every viewer.
///
/// The lock only ever guards an `Arc` swap or clone; encoding and
/// annotation happen on the reader's own copy outside of it.
pub struct FrameStore {
    current: RwLock<Option<Arc<Frame>>>,
    placeholder: Option<Arc<Frame>>,
}

impl FrameStore {
    pub fn new(placeholder: Option<Frame>) -> Self {
        Self {
            current: RwLock::new(None),
            placeholder: placeholder.map(Arc::new),
        }
    }

    /// Build a store, loading the placeholder from `path` once.
    ///
    /// A missing or broken placeholder is logged and the store runs without
    /// one.
    pub fn with_placeholder_path(path: &Path) -> Self {
        let placeholder = match load_placeholder(path) {
            Ok(Some(frame)) => {
                let (width, height) = frame.dimensions();
                info!(
                    path = %path.display(),
                    bytes = frame.payload_size(),
                    width,
                    height,
                    "placeholder loaded"
                );
                Some(frame)
            }
            Ok(None) => {
                info!(path = %path.display(), "no placeholder file, viewers wait for the first frame");
                None
            }
            Err(e) => {
                warn!(error = %e, "placeholder unusable, continuing without it");
                None
            }
        };
        Self::new(placeholder)
    }

    /// Replace the current frame. Sequence numbers are assigned under the
    /// write guard, so the stored frame always carries the highest one.
    pub fn write(&self, data: Bytes, image: DynamicImage) -> Arc<Frame> {
        let received_at_ms = Utc::now().timestamp_millis();
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let seq = slot.as_ref().map_or(1, |prev| prev.seq + 1);
        let frame = Arc::new(Frame::new(data, image, seq, received_at_ms));
        *slot = Some(Arc::clone(&frame));
        drop(slot);

        debug!(seq, bytes = frame.payload_size(), "current frame replaced");
        frame
    }

    /// Current frame, else placeholder, else [`Snapshot::NoFrame`].
    pub fn read(&self) -> Snapshot {
        if let Some(frame) = self.current() {
            return Snapshot::Live(frame);
        }
        match &self.placeholder {
            Some(frame) => Snapshot::Placeholder(Arc::clone(frame)),
            None => Snapshot::NoFrame,
        }
    }

    /// The live frame only, ignoring the placeholder.
    pub fn current(&self) -> Option<Arc<Frame>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn has_placeholder(&self) -> bool {
        self.placeholder.is_some()
    }
}

/// Read and decode the placeholder image. `Ok(None)` if the file does not
/// exist.
pub fn load_placeholder(path: &Path) -> Result<Option<Frame>, PlaceholderError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PlaceholderError::Read(path.to_path_buf(), e)),
    };
    let image =
        decode_image(&bytes).map_err(|e| PlaceholderError::Decode(path.to_path_buf(), e))?;
    Ok(Some(Frame::new(
        Bytes::from(bytes),
        image,
        0,
        Utc::now().timestamp_millis(),
    )))
}
