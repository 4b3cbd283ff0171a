use bytes::Bytes;
use image::DynamicImage;

/// One validated camera frame as held by the relay.
///
/// Keeps the encoded bytes exactly as they arrived together with the pixel
/// buffer decoded during validation, so readers never decode on their own.
/// Frames are immutable; a newer frame replaces an older one wholesale.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Store-assigned sequence number. Live frames start at 1, the
    /// placeholder is always 0.
    pub seq: u64,
    /// Arrival time, Unix millis.
    pub received_at_ms: i64,
    data: Bytes,
    image: DynamicImage,
}

impl Frame {
    pub fn new(data: Bytes, image: DynamicImage, seq: u64, received_at_ms: i64) -> Self {
        Self {
            seq,
            received_at_ms,
            data,
            image,
        }
    }

    /// The encoded bytes as received.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The decoded pixel buffer.
    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn payload_size(&self) -> usize {
        self.data.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    /// Arrival time formatted for log lines.
    pub fn received_at(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.received_at_ms)
            .unwrap_or_else(chrono::Utc::now)
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string()
    }
}
