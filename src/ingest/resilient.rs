//! Reconnecting wrapper around a capture device.
//!
//! `ResilientConnection` is the only place that decides when a camera
//! connection is opened, declared dead, or retried. It never sleeps on its
//! own: `poll()` reports `Backoff(delay)` and the caller chooses how to wait,
//! so the capture thread stays interruptible on shutdown.

use anyhow::Result;
use image::RgbImage;
use rand::Rng;
use std::time::{Duration, Instant};

use super::VideoCapture;

/// Exponential reconnect delay with optional jitter.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomised in either direction (0.0..=1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let max_nanos = self.max.as_nanos() as f64;
        let base = (self.initial.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent))
            .min(max_nanos);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let nanos = if jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            (base * factor).min(max_nanos)
        } else {
            base
        };
        Duration::from_nanos(nanos.max(0.0).round() as u64)
    }
}

/// Result of one `poll()`.
#[derive(Debug)]
pub enum Poll {
    Frame(RgbImage),
    /// Connected but nothing new yet.
    Pending,
    /// Connection is down; wait this long before polling again.
    Backoff(Duration),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames: u64,
    pub reconnects: u64,
    pub stalls: u64,
    pub connected: bool,
}

pub struct ResilientConnection {
    capture: Box<dyn VideoCapture>,
    backoff: BackoffPolicy,
    stall_timeout: Duration,
    connected: bool,
    /// Last frame, or the moment the connection opened.
    last_progress: Instant,
    failures: u32,
    ever_connected: bool,
    stats: ConnectionStats,
}

impl ResilientConnection {
    pub fn new(
        capture: Box<dyn VideoCapture>,
        backoff: BackoffPolicy,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            capture,
            backoff,
            stall_timeout,
            connected: false,
            last_progress: Instant::now(),
            failures: 0,
            ever_connected: false,
            stats: ConnectionStats::default(),
        }
    }

    pub fn describe(&self) -> String {
        self.capture.describe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connected: self.connected,
            ..self.stats
        }
    }

    /// Open if needed, then read once.
    pub fn poll(&mut self) -> Poll {
        if !self.connected {
            if let Err(err) = self.connect() {
                return self.fail("open failed", &err);
            }
        }

        match self.capture.read_frame() {
            Ok(Some(image)) => {
                self.last_progress = Instant::now();
                self.failures = 0;
                self.stats.frames += 1;
                Poll::Frame(image)
            }
            Ok(None) => {
                let quiet = self.last_progress.elapsed();
                if quiet >= self.stall_timeout {
                    self.stats.stalls += 1;
                    log::warn!(
                        "capture: no frame from {} for {:.1}s; forcing reconnect",
                        self.describe(),
                        quiet.as_secs_f32()
                    );
                    self.release();
                    self.failures += 1;
                    Poll::Backoff(self.backoff.delay(self.failures))
                } else {
                    Poll::Pending
                }
            }
            Err(err) => self.fail("read failed", &err),
        }
    }

    /// Release the device. The next `poll()` reopens it.
    pub fn disconnect(&mut self) {
        if self.connected {
            log::info!("capture: closing {}", self.describe());
        }
        self.release();
        self.failures = 0;
    }

    fn connect(&mut self) -> Result<()> {
        self.capture.open()?;
        if self.ever_connected {
            self.stats.reconnects += 1;
        }
        self.ever_connected = true;
        self.connected = true;
        self.last_progress = Instant::now();
        Ok(())
    }

    fn fail(&mut self, what: &str, err: &anyhow::Error) -> Poll {
        self.release();
        self.failures += 1;
        let delay = self.backoff.delay(self.failures);
        log::warn!(
            "capture: {} for {}: {:#}; retrying in {:?}",
            what,
            self.describe(),
            err,
            delay
        );
        Poll::Backoff(delay)
    }

    fn release(&mut self) {
        self.capture.release();
        self.connected = false;
    }
}

impl Drop for ResilientConnection {
    fn drop(&mut self) {
        self.capture.release();
    }
}
