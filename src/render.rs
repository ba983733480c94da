//! Frame compositor.
//!
//! Runs at the output frame rate, independent of inference. Each tick while
//! active it resizes and corrects the newest camera frame, hands a copy to
//! the detection worker, draws the most recent boxes over it and publishes
//! the JPEG that viewers receive. Boxes may be a few hundred milliseconds
//! older than the picture; video never waits for the model.
//!
//! When the activity gate closes, the compositor stops the camera and
//! publishes a standby card instead.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::activity::ActivityGate;
use crate::cell::LatestCell;
use crate::detect::{Detection, ObjectClass};
use crate::frame::{EncodedFrame, Frame};
use crate::ingest::frame_interval;
use crate::source::FrameSource;
use crate::worker::{nap, BoxList, IDLE_POLL};

const LABEL_PX: f32 = 18.0;
const CAPTION_PX: f32 = 36.0;
const BOX_THICKNESS: i32 = 2;

#[derive(Clone, Debug)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
    pub target_fps: u32,
    /// Contrast gain.
    pub alpha: f32,
    /// Brightness offset.
    pub beta: f32,
    pub font_path: Option<PathBuf>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            jpeg_quality: 70,
            target_fps: 15,
            alpha: 1.1,
            beta: 8.0,
            font_path: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Standby,
    Reconnecting,
    Live,
}

/// Cells the compositor reads and writes.
#[derive(Clone)]
pub struct CompositorChannels {
    pub gate: Arc<ActivityGate>,
    pub inference: Arc<LatestCell<Arc<Frame>>>,
    pub boxes: Arc<LatestCell<BoxList>>,
    pub output: Arc<LatestCell<Arc<EncodedFrame>>>,
}

/// Static cards shown instead of video.
#[derive(Clone, Debug)]
pub struct Placeholders {
    pub standby: Arc<EncodedFrame>,
    pub reconnecting: Arc<EncodedFrame>,
}

impl Placeholders {
    pub fn render(settings: &RenderSettings, font: Option<&FontVec>) -> Result<Self> {
        let standby = placeholder_card(settings, Rgb([24, 28, 36]), "STANDBY", font);
        let reconnecting =
            placeholder_card(settings, Rgb([48, 30, 16]), "STREAM DROPPED - RECONNECTING", font);
        Ok(Self {
            standby: Arc::new(
                EncodedFrame::encode(&standby, settings.jpeg_quality, 0)
                    .context("encode standby card")?,
            ),
            reconnecting: Arc::new(
                EncodedFrame::encode(&reconnecting, settings.jpeg_quality, 0)
                    .context("encode reconnecting card")?,
            ),
        })
    }
}

/// Load the label font. Without one, boxes are drawn without captions.
pub fn load_font(path: Option<&Path>) -> Option<FontVec> {
    let Some(path) = path else {
        log::warn!("no label font configured; drawing boxes without captions");
        return None;
    };
    let loaded = std::fs::read(path)
        .with_context(|| format!("read font {}", path.display()))
        .and_then(|bytes| {
            FontVec::try_from_vec(bytes)
                .map_err(|err| anyhow::anyhow!("parse font {}: {}", path.display(), err))
        });
    match loaded {
        Ok(font) => Some(font),
        Err(err) => {
            log::warn!("{:#}; drawing boxes without captions", err);
            None
        }
    }
}

pub struct FrameCompositor {
    channels: CompositorChannels,
    source: FrameSource,
    settings: RenderSettings,
    placeholders: Placeholders,
    font: Option<FontVec>,
    showing: Option<TickOutcome>,
    last_sequence: u64,
    was_active: bool,
}

impl FrameCompositor {
    pub fn new(
        channels: CompositorChannels,
        source: FrameSource,
        settings: RenderSettings,
        placeholders: Placeholders,
        font: Option<FontVec>,
    ) -> Self {
        Self {
            channels,
            source,
            settings,
            placeholders,
            font,
            showing: None,
            last_sequence: 0,
            was_active: false,
        }
    }

    pub fn source(&self) -> &FrameSource {
        &self.source
    }

    pub fn tick(&mut self) -> TickOutcome {
        if !self.channels.gate.is_active() {
            if self.was_active {
                log::info!("no viewers for {:?}; suspending capture", self.channels.gate.idle_timeout());
                self.source.stop();
                self.channels.inference.clear();
                self.was_active = false;
            }
            self.show_placeholder(TickOutcome::Standby);
            return TickOutcome::Standby;
        }
        if !self.was_active {
            log::info!("viewer activity; resuming capture");
            self.was_active = true;
        }
        if !self.source.is_running() {
            if let Err(err) = self.source.start() {
                log::warn!("could not start capture: {:#}", err);
            }
        }

        let Some(frame) = self.source.read() else {
            self.channels.inference.clear();
            self.show_placeholder(TickOutcome::Reconnecting);
            return TickOutcome::Reconnecting;
        };
        if frame.sequence == self.last_sequence && self.showing == Some(TickOutcome::Live) {
            return TickOutcome::Live;
        }
        self.last_sequence = frame.sequence;

        let prepared = Arc::new(frame.with_image(self.prepare(&frame.image)));
        self.channels.inference.publish(Arc::clone(&prepared));

        let mut canvas = prepared.image.clone();
        if let Some(boxes) = self.channels.boxes.latest() {
            draw_detections(&mut canvas, &boxes, self.font.as_ref());
        }
        match EncodedFrame::encode(&canvas, self.settings.jpeg_quality, prepared.sequence) {
            Ok(encoded) => {
                self.channels.output.publish(Arc::new(encoded));
                self.showing = Some(TickOutcome::Live);
            }
            Err(err) => log::warn!("frame {} not published: {:#}", prepared.sequence, err),
        }
        TickOutcome::Live
    }

    /// Tick at the target frame rate until `shutdown` is set, then stop capture.
    pub fn run(mut self, shutdown: &AtomicBool) {
        let interval = frame_interval(self.settings.target_fps);
        log::info!(
            "compositor started: {}x{} @ {} fps",
            self.settings.width,
            self.settings.height,
            self.settings.target_fps
        );
        while !shutdown.load(Ordering::SeqCst) {
            let started = std::time::Instant::now();
            let pause = match self.tick() {
                TickOutcome::Standby => IDLE_POLL,
                _ => interval.saturating_sub(started.elapsed()),
            };
            nap(shutdown, pause);
        }
        self.source.stop();
        log::info!("compositor stopped");
    }

    fn prepare(&self, image: &RgbImage) -> RgbImage {
        let mut out = if image.dimensions() == (self.settings.width, self.settings.height) {
            image.clone()
        } else {
            image::imageops::resize(
                image,
                self.settings.width,
                self.settings.height,
                FilterType::Triangle,
            )
        };
        correct(&mut out, self.settings.alpha, self.settings.beta);
        out
    }

    fn show_placeholder(&mut self, outcome: TickOutcome) {
        if self.showing == Some(outcome) {
            return;
        }
        let card = match outcome {
            TickOutcome::Standby => &self.placeholders.standby,
            _ => &self.placeholders.reconnecting,
        };
        self.channels.output.publish(Arc::clone(card));
        self.showing = Some(outcome);
    }
}

/// Linear brightness/contrast map: `v * alpha + beta`, clamped.
pub fn correct(image: &mut RgbImage, alpha: f32, beta: f32) {
    if alpha == 1.0 && beta == 0.0 {
        return;
    }
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        *slot = (v as f32 * alpha + beta).round().clamp(0.0, 255.0) as u8;
    }
    for px in image.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = lut[*c as usize];
        }
    }
}

fn class_color(class: ObjectClass) -> Rgb<u8> {
    match class {
        ObjectClass::Person => Rgb([255, 64, 64]),
        ObjectClass::Bicycle => Rgb([255, 160, 0]),
        ObjectClass::Car => Rgb([0, 220, 90]),
        ObjectClass::Motorcycle => Rgb([255, 230, 0]),
        ObjectClass::Bus => Rgb([0, 170, 255]),
        ObjectClass::Truck => Rgb([200, 90, 255]),
    }
}

pub fn draw_detections(canvas: &mut RgbImage, detections: &[Detection], font: Option<&FontVec>) {
    let (cw, ch) = (canvas.width() as f32, canvas.height() as f32);
    for det in detections {
        let x1 = det.bbox.x1.clamp(0.0, cw - 1.0);
        let y1 = det.bbox.y1.clamp(0.0, ch - 1.0);
        let x2 = det.bbox.x2.clamp(0.0, cw);
        let y2 = det.bbox.y2.clamp(0.0, ch);
        let (w, h) = ((x2 - x1) as u32, (y2 - y1) as u32);
        if w == 0 || h == 0 {
            continue;
        }
        let color = class_color(det.class);
        let (x, y) = (x1 as i32, y1 as i32);
        for inset in 0..BOX_THICKNESS {
            let shrink = (inset * 2) as u32;
            if w > shrink && h > shrink {
                draw_hollow_rect_mut(
                    canvas,
                    Rect::at(x + inset, y + inset).of_size(w - shrink, h - shrink),
                    color,
                );
            }
        }

        if let Some(font) = font {
            let text = det.label();
            let scale = PxScale::from(LABEL_PX);
            let (tw, th) = text_size(scale, font, &text);
            let ty = (y - th as i32 - 6).max(0);
            draw_filled_rect_mut(canvas, Rect::at(x, ty).of_size(tw + 6, th + 6), color);
            draw_text_mut(canvas, Rgb([0, 0, 0]), x + 3, ty + 3, scale, font, &text);
        }
    }
}

fn placeholder_card(
    settings: &RenderSettings,
    background: Rgb<u8>,
    caption: &str,
    font: Option<&FontVec>,
) -> RgbImage {
    let (w, h) = (settings.width.max(1), settings.height.max(1));
    let mut card = RgbImage::from_pixel(w, h, background);
    // Accent bar so the cards differ even without a font.
    let bar_h = (h / 24).max(2);
    draw_filled_rect_mut(
        &mut card,
        Rect::at(0, (h / 2 + h / 8) as i32).of_size(w, bar_h),
        Rgb([200, 200, 200]),
    );
    if let Some(font) = font {
        let scale = PxScale::from(CAPTION_PX);
        let (tw, th) = text_size(scale, font, caption);
        let x = (w as i32 - tw as i32) / 2;
        let y = (h as i32 - th as i32) / 2;
        draw_text_mut(&mut card, Rgb([230, 230, 230]), x.max(0), y.max(0), scale, font, caption);
    }
    card
}
