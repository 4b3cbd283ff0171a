//! Shared fixtures for unit tests.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

/// Deterministic noise image encoded as JPEG. Noise compresses badly, so
/// anything from 64x64 up is comfortably above the 5000-byte floor.
pub fn noisy_jpeg(width: u32, height: u32, seed: u32) -> Bytes {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    let img = RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        Rgb([r, g, b])
    });
    let mut buf = Vec::new();
    img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 95))
        .expect("encode test jpeg");
    Bytes::from(buf)
}

/// Starts like a JPEG but is garbage after the SOI marker.
pub fn corrupt_payload(len: usize) -> Bytes {
    let mut buf = vec![0xFF, 0xD8, 0xFF, 0xE0];
    buf.resize(len, 0x5A);
    Bytes::from(buf)
}
