//! HTTP camera source.
//!
//! Supports `multipart/x-mixed-replace` MJPEG streams and plain JPEG snapshot
//! endpoints (polled once per read). Frames are located by JPEG SOI/EOI
//! markers, so the multipart boundary string does not matter.
//!
//! A stream that keeps sending bytes without completing a JPEG yields
//! `Ok(None)` after a bounded wait, so the connection watchdog still sees
//! the stall.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::Read;
use std::time::{Duration, Instant};

use super::{frame_interval, CaptureSettings, VideoCapture};

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest a single `read_frame` waits for a complete JPEG.
const FRAME_WAIT: Duration = Duration::from_secs(1);

pub struct MjpegCapture {
    settings: CaptureSettings,
    url: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    Snapshot,
}

impl MjpegCapture {
    pub fn new(settings: CaptureSettings) -> Result<Self> {
        let url = settings.authenticated_url()?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(settings.read_timeout)
            .build();
        Ok(Self {
            settings,
            url,
            agent,
            stream: None,
            last_frame_at: None,
        })
    }

    fn fetch_snapshot(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .context("fetch jpeg snapshot")?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl VideoCapture for MjpegCapture {
    fn describe(&self) -> String {
        self.settings.redacted_url()
    }

    fn open(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to {}", self.describe()))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = Some(if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegReader::new(response.into_reader()))
        } else {
            HttpStream::Snapshot
        });
        log::info!("capture: connected to {} ({})", self.describe(), content_type);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let min_interval = frame_interval(self.settings.target_fps);
        let jpeg = match self.stream.as_mut() {
            None => return Err(anyhow!("http source not connected; call open() first")),
            Some(HttpStream::Mjpeg(reader)) => {
                match reader.read_next_jpeg(self.settings.read_timeout.min(FRAME_WAIT))? {
                    Some(jpeg) => jpeg,
                    None => return Ok(None),
                }
            }
            Some(HttpStream::Snapshot) => {
                if let Some(last) = self.last_frame_at {
                    let elapsed = last.elapsed();
                    if elapsed < min_interval {
                        std::thread::sleep(min_interval - elapsed);
                    }
                }
                self.fetch_snapshot()?
            }
        };
        self.last_frame_at = Some(Instant::now());
        decode_jpeg(&jpeg).map(Some)
    }

    fn release(&mut self) {
        self.stream = None;
    }
}

pub(crate) struct MjpegReader {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    pub(crate) fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` when none finished within `wait`.
    /// Partial data stays buffered for the next call.
    pub(crate) fn read_next_jpeg(&mut self, wait: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + wait;
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(image.into_rgb8())
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::EncodedFrame;
    use std::io::Cursor;

    fn jpeg(shade: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(16, 8, image::Rgb([shade, shade, shade]));
        EncodedFrame::encode(&image, 80, 1).unwrap().jpeg
    }

    #[test]
    fn finds_jpeg_between_markers() {
        let data = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0x03];
        assert_eq!(find_jpeg_bounds(&data), Some((1, 7)));
        assert_eq!(find_jpeg_bounds(&data[..5]), None);
    }

    #[test]
    fn reader_splits_multipart_body() -> Result<()> {
        let mut body = Vec::new();
        for shade in [10u8, 200u8] {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&jpeg(shade));
            body.extend_from_slice(b"\r\n");
        }
        let mut reader = MjpegReader::new(Box::new(Cursor::new(body)));

        let wait = Duration::from_secs(1);
        let first = decode_jpeg(&reader.read_next_jpeg(wait)?.expect("first jpeg"))?;
        let second = decode_jpeg(&reader.read_next_jpeg(wait)?.expect("second jpeg"))?;
        assert_eq!(first.dimensions(), (16, 8));
        assert!(first.get_pixel(4, 4).0[0] < 60);
        assert!(second.get_pixel(4, 4).0[0] > 150);
        assert!(reader.read_next_jpeg(wait).is_err());
        Ok(())
    }

    /// Sends one non-JPEG byte per read, forever.
    struct Trickle;

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(20));
            buf[0] = 0x42;
            Ok(1)
        }
    }

    struct TrickleCapture {
        reader: Option<MjpegReader>,
    }

    impl VideoCapture for TrickleCapture {
        fn describe(&self) -> String {
            "trickle".to_string()
        }

        fn open(&mut self) -> Result<()> {
            self.reader = Some(MjpegReader::new(Box::new(Trickle)));
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Option<RgbImage>> {
            let reader = self.reader.as_mut().ok_or_else(|| anyhow!("not open"))?;
            match reader.read_next_jpeg(Duration::from_millis(100))? {
                Some(jpeg) => decode_jpeg(&jpeg).map(Some),
                None => Ok(None),
            }
        }

        fn release(&mut self) {
            self.reader = None;
        }
    }

    #[test]
    fn incomplete_jpeg_gives_up_after_wait() -> Result<()> {
        let mut reader = MjpegReader::new(Box::new(Trickle));
        let started = Instant::now();
        assert!(reader.read_next_jpeg(Duration::from_millis(150))?.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn trickling_stream_trips_the_watchdog() {
        use crate::ingest::{BackoffPolicy, Poll, ResilientConnection};

        let mut conn = ResilientConnection::new(
            Box::new(TrickleCapture { reader: None }),
            BackoffPolicy::default(),
            Duration::from_millis(300),
        );
        let started = Instant::now();
        let mut tripped = false;
        while started.elapsed() < Duration::from_secs(3) {
            match conn.poll() {
                Poll::Backoff(_) => {
                    tripped = true;
                    break;
                }
                Poll::Pending => {}
                Poll::Frame(_) => panic!("garbage decoded as a frame"),
            }
        }
        assert!(tripped, "stall was never detected");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(conn.stats().stalls, 1);
        assert!(!conn.is_connected());
    }
}
