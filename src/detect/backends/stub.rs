use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::frame::Frame;

/// Pixels at or above this luma count as "object".
const BRIGHT_LUMA: u16 = 200;
/// Ignore blobs smaller than this many pixels (sensor noise).
const MIN_BLOB_PIXELS: u32 = 64;
/// Subsample stride; the synthetic scene has large flat regions.
const STRIDE: u32 = 2;

/// Stub backend for demos and tests.
///
/// Reports the bounding box of all saturated pixels as a single CAR. Paired
/// with the `stub://` camera this exercises tracking and counting end to end
/// without a model file.
pub struct StubBackend {
    confidence: f32,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { confidence: 0.9 }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let image = &frame.image;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut hits = 0u32;

        for y in (0..image.height()).step_by(STRIDE as usize) {
            for x in (0..image.width()).step_by(STRIDE as usize) {
                let [r, g, b] = image.get_pixel(x, y).0;
                let luma = (r as u16 * 3 + g as u16 * 6 + b as u16) / 10;
                if luma >= BRIGHT_LUMA {
                    hits += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        if hits * STRIDE * STRIDE < MIN_BLOB_PIXELS {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + STRIDE) as f32,
            (max_y + STRIDE) as f32,
        );
        Ok(vec![Detection::new(bbox, ObjectClass::Car, self.confidence)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn dark_frame_has_no_detections() -> Result<()> {
        let mut backend = StubBackend::new();
        let frame = Frame::new(RgbImage::from_pixel(64, 48, Rgb([20, 20, 20])), 1);
        assert!(backend.detect(&frame)?.is_empty());
        Ok(())
    }

    #[test]
    fn bright_block_is_reported_as_car() -> Result<()> {
        let mut backend = StubBackend::new();
        let mut image = RgbImage::from_pixel(64, 48, Rgb([20, 20, 20]));
        for y in 10..30 {
            for x in 20..40 {
                image.put_pixel(x, y, Rgb([250, 250, 250]));
            }
        }
        let detections = backend.detect(&Frame::new(image, 1))?;
        assert_eq!(detections.len(), 1);
        let det = &detections[0];
        assert_eq!(det.class, ObjectClass::Car);
        assert_eq!(det.track_id, None);
        assert_eq!((det.bbox.x1, det.bbox.y1), (20.0, 10.0));
        assert_eq!((det.bbox.x2, det.bbox.y2), (40.0, 30.0));
        Ok(())
    }
}
