use image::{DynamicImage, ImageReader};
use std::io::Cursor;

pub const DEFAULT_MIN_FRAME_BYTES: usize = 5000;

/// Why an inbound payload was not accepted as a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    /// Keepalive or noise, not a real failure.
    #[error("payload of {len} bytes is not larger than the {min}-byte minimum")]
    TooSmall { len: usize, min: usize },
    #[error("payload failed to decode: {0}")]
    DecodeFailure(String),
}

#[derive(Debug)]
pub enum ValidationResult {
    /// Decoded pixels, ready to be stored alongside the original bytes.
    Accepted(DynamicImage),
    Rejected(RejectReason),
}

#[cfg(test)]
impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Accepted(_))
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            ValidationResult::Accepted(_) => None,
            ValidationResult::Rejected(reason) => Some(reason),
        }
    }
}

/// Decides whether raw bytes are a usable image.
///
/// Pure: it never touches the frame store, callers decide what to do with
/// the result.
#[derive(Debug, Clone, Copy)]
pub struct FrameValidator {
    min_frame_bytes: usize,
}

impl FrameValidator {
    pub fn new(min_frame_bytes: usize) -> Self {
        Self { min_frame_bytes }
    }

    pub fn min_frame_bytes(&self) -> usize {
        self.min_frame_bytes
    }

    pub fn validate(&self, bytes: &[u8]) -> ValidationResult {
        if bytes.len() <= self.min_frame_bytes {
            return ValidationResult::Rejected(RejectReason::TooSmall {
                len: bytes.len(),
                min: self.min_frame_bytes,
            });
        }

        match decode_image(bytes) {
            Ok(image) => ValidationResult::Accepted(image),
            Err(reason) => ValidationResult::Rejected(RejectReason::DecodeFailure(reason)),
        }
    }
}

impl Default for FrameValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_FRAME_BYTES)
    }
}

/// Decode bytes of any supported format, guessing it from the magic bytes.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, String> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| e.to_string())?
        .decode()
        .map_err(|e| e.to_string())
}
