//! Synthetic camera (`stub://`).
//!
//! Renders a dark road with one bright "vehicle" block sliding across it, at
//! the configured frame rate. Deterministic, so tests and demos behave the
//! same everywhere.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::time::Instant;

use super::{frame_interval, CaptureSettings, VideoCapture};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const VEHICLE_W: u32 = 96;
const VEHICLE_H: u32 = 48;
const STEP_PX: u32 = 8;
/// Frames with an empty road between vehicles.
const GAP_FRAMES: u64 = 20;

pub struct SyntheticCapture {
    settings: CaptureSettings,
    open: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticCapture {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            open: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn render(&self) -> RgbImage {
        let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb([28, 30, 34]));
        // Lane marking.
        for x in (0..WIDTH).step_by(40) {
            for dx in 0..20 {
                for y in HEIGHT / 2..HEIGHT / 2 + 3 {
                    image.put_pixel((x + dx).min(WIDTH - 1), y, Rgb([120, 120, 90]));
                }
            }
        }

        let travel = (WIDTH + VEHICLE_W) / STEP_PX;
        let cycle = travel as u64 + GAP_FRAMES;
        let pos = self.frame_count % cycle;
        if pos < travel as u64 {
            let left = (pos as u32 * STEP_PX) as i64 - VEHICLE_W as i64;
            let top = HEIGHT / 2 + 12;
            for y in top..top + VEHICLE_H {
                for x in left.max(0)..(left + VEHICLE_W as i64).min(WIDTH as i64) {
                    image.put_pixel(x as u32, y, Rgb([245, 245, 240]));
                }
            }
        }
        image
    }
}

impl VideoCapture for SyntheticCapture {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.settings.redacted_url())
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!("capture: connected to {}", self.describe());
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        if !self.open {
            return Err(anyhow!("synthetic source not open"));
        }
        let interval = frame_interval(self.settings.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
        self.frame_count += 1;
        Ok(Some(self.render()))
    }

    fn release(&mut self) {
        self.open = false;
    }
}
