use std::any::Any;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use frame_relay_common::config::AnnotateConfig;
use image::{DynamicImage, Rgb};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum AnnotateError {
    #[error("frame {width}x{height} is too small for a {thickness}px border")]
    FrameTooSmall {
        width: u32,
        height: u32,
        thickness: u32,
    },
    #[error("annotation model failed: {0}")]
    Model(String),
    #[error("unknown annotator kind '{0}', expected 'none' or 'border'")]
    UnknownKind(String),
    #[error("border thickness {thickness} is outside 1..={max}")]
    InvalidThickness { thickness: u32, max: u32 },
}

/// Largest border accepted from config.
pub const MAX_BORDER_THICKNESS: u32 = 1024;

/// Pluggable per-frame overlay applied before frames are encoded for viewers.
///
/// Implementations receive the decoded frame and return a new image; they
/// must not keep mutable state between calls because every viewer session
/// calls them independently.
pub trait Annotator: Send + Sync {
    fn annotate(&self, image: &DynamicImage) -> Result<DynamicImage, AnnotateError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Run the annotator if there is one. On failure, including a panic inside
/// the annotator, the frame is passed through unchanged.
pub fn annotate_or_passthrough<'a>(
    annotator: Option<&dyn Annotator>,
    image: &'a DynamicImage,
) -> Cow<'a, DynamicImage> {
    let Some(annotator) = annotator else {
        return Cow::Borrowed(image);
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| annotator.annotate(image)))
        .unwrap_or_else(|payload| Err(AnnotateError::Model(panic_message(payload))));
    match outcome {
        Ok(annotated) => Cow::Owned(annotated),
        Err(e) => {
            warn!(error = %e, annotator = annotator.name(), "annotation failed, sending frame as-is");
            Cow::Borrowed(image)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => format!("panicked: {message}"),
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => format!("panicked: {message}"),
            Err(_) => "panicked".to_string(),
        },
    }
}

/// Build the annotator selected in config. `none` yields no annotator.
pub fn from_config(config: &AnnotateConfig) -> Result<Option<Arc<dyn Annotator>>, AnnotateError> {
    match config.kind.as_str() {
        "none" | "" => Ok(None),
        "border" => {
            if config.thickness == 0 || config.thickness > MAX_BORDER_THICKNESS {
                return Err(AnnotateError::InvalidThickness {
                    thickness: config.thickness,
                    max: MAX_BORDER_THICKNESS,
                });
            }
            Ok(Some(Arc::new(BorderAnnotator::new(
                Rgb(config.color),
                config.thickness,
            ))))
        }
        other => Err(AnnotateError::UnknownKind(other.to_string())),
    }
}

/// Draws a rectangle outline inset from the frame edges by one border width,
/// the same shape a detector's bounding-box overlay takes.
pub struct BorderAnnotator {
    color: Rgb<u8>,
    thickness: u32,
}

impl BorderAnnotator {
    pub fn new(color: Rgb<u8>, thickness: u32) -> Self {
        Self {
            color,
            thickness: thickness.max(1),
        }
    }

    // callers guarantee width and height are at least 4 * thickness + 1
    fn on_outline(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        let t = self.thickness;
        let (left, top) = (t, t);
        let (right, bottom) = (width - t, height - t);
        let inside_box = x >= left && x < right && y >= top && y < bottom;
        let inside_hole = x >= left + t && x < right - t && y >= top + t && y < bottom - t;
        inside_box && !inside_hole
    }
}

impl Annotator for BorderAnnotator {
    fn annotate(&self, image: &DynamicImage) -> Result<DynamicImage, AnnotateError> {
        let (width, height) = (image.width(), image.height());
        // inset + band on both sides, plus at least one untouched pixel inside
        let min_side = self.thickness.checked_mul(4).and_then(|v| v.checked_add(1));
        let fits = min_side.is_some_and(|min| width >= min && height >= min);
        if !fits {
            return Err(AnnotateError::FrameTooSmall {
                width,
                height,
                thickness: self.thickness,
            });
        }

        let mut rgb = image.to_rgb8();
        for (x, y, pixel) in rgb.enumerate_pixels_mut() {
            if self.on_outline(x, y, width, height) {
                *pixel = self.color;
            }
        }
        Ok(DynamicImage::ImageRgb8(rgb))
    }

    fn name(&self) -> &str {
        "border"
    }
}
