//! MJPEG fan-out.
//!
//! Every viewer gets its own `ViewerStream`, an endless iterator over the
//! shared output frame. Viewers never encode anything themselves and never
//! see each other; each free-runs at the capped rate. The stream holds a
//! `ViewerGuard`, so dropping it (client gone, write error, panic) always
//! releases the viewer slot on the activity gate.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::activity::{ActivityGate, ViewerGuard};
use crate::cell::LatestCell;
use crate::frame::EncodedFrame;
use crate::ingest::frame_interval;

pub const MJPEG_BOUNDARY: &str = "frame";

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY)
}

#[derive(Clone)]
pub struct StreamBroadcaster {
    output: Arc<LatestCell<Arc<EncodedFrame>>>,
    gate: Arc<ActivityGate>,
    standby: Arc<EncodedFrame>,
    interval: Duration,
}

impl StreamBroadcaster {
    pub fn new(
        output: Arc<LatestCell<Arc<EncodedFrame>>>,
        gate: Arc<ActivityGate>,
        standby: Arc<EncodedFrame>,
        max_fps: u32,
    ) -> Self {
        Self {
            output,
            gate,
            standby,
            interval: frame_interval(max_fps),
        }
    }

    /// Register a viewer and return its frame sequence.
    pub fn connect(&self) -> ViewerStream {
        ViewerStream {
            _guard: self.gate.viewer_connected(),
            output: Arc::clone(&self.output),
            standby: Arc::clone(&self.standby),
            interval: self.interval,
            next_due: None,
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.gate.viewer_count()
    }
}

pub struct ViewerStream {
    _guard: ViewerGuard,
    output: Arc<LatestCell<Arc<EncodedFrame>>>,
    standby: Arc<EncodedFrame>,
    interval: Duration,
    next_due: Option<Instant>,
}

impl Iterator for ViewerStream {
    type Item = Arc<EncodedFrame>;

    /// The first part is always the standby card, sent immediately so the
    /// client sees bytes before any read timeout. Later parts follow the
    /// shared output at the capped rate.
    fn next(&mut self) -> Option<Self::Item> {
        let Some(due) = self.next_due else {
            self.next_due = Some(Instant::now() + self.interval);
            return Some(Arc::clone(&self.standby));
        };
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(Instant::now() + self.interval);
        Some(
            self.output
                .latest()
                .unwrap_or_else(|| Arc::clone(&self.standby)),
        )
    }
}

/// Write one multipart part.
pub fn write_part<W: Write>(writer: &mut W, frame: &EncodedFrame) -> io::Result<()> {
    write!(
        writer,
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        MJPEG_BOUNDARY,
        frame.jpeg.len()
    )?;
    writer.write_all(&frame.jpeg)?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}
