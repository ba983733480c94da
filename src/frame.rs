//! Frame types passed between pipeline stages.
//!
//! - `Frame`: decoded RGB pixels plus capture metadata. Immutable once
//!   produced; stages share it behind an `Arc` and clone the pixels before
//!   drawing on them.
//! - `EncodedFrame`: the compressed JPEG that viewers receive.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::time::{Instant, SystemTime};

/// Decoded video frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic per-source sequence number (starts at 1).
    pub sequence: u64,
    /// Wall-clock capture time.
    pub captured_at: SystemTime,
    /// Monotonic capture instant, for age checks.
    pub captured_instant: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: SystemTime::now(),
            captured_instant: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Same metadata, different pixels (used after resize/correction).
    pub fn with_image(&self, image: RgbImage) -> Self {
        Self {
            image,
            sequence: self.sequence,
            captured_at: self.captured_at,
            captured_instant: self.captured_instant,
        }
    }
}

/// JPEG bytes ready for broadcast.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Sequence of the source frame, 0 for placeholder cards.
    pub sequence: u64,
}

impl EncodedFrame {
    pub fn encode(image: &RgbImage, quality: u8, sequence: u64) -> Result<Self> {
        let mut jpeg = Vec::with_capacity(64 * 1024);
        JpegEncoder::new_with_quality(&mut jpeg, quality)
            .encode(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgb8,
            )
            .context("encode jpeg")?;
        Ok(Self {
            jpeg,
            width: image.width(),
            height: image.height(),
            sequence,
        })
    }

    pub fn is_placeholder(&self) -> bool {
        self.sequence == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_jpeg_markers() -> Result<()> {
        let image = RgbImage::from_pixel(32, 16, image::Rgb([40, 80, 120]));
        let encoded = EncodedFrame::encode(&image, 70, 5)?;
        assert_eq!(&encoded.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&encoded.jpeg[encoded.jpeg.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!((encoded.width, encoded.height), (32, 16));
        assert!(!encoded.is_placeholder());
        Ok(())
    }

    #[test]
    fn with_image_keeps_metadata() {
        let frame = Frame::new(RgbImage::new(4, 4), 9);
        let resized = frame.with_image(RgbImage::new(2, 2));
        assert_eq!(resized.sequence, 9);
        assert_eq!(resized.captured_at, frame.captured_at);
        assert_eq!(resized.width(), 2);
    }
}
