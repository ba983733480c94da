//! Capture thread.
//!
//! `FrameSource` owns the camera connection exclusively. While running, a
//! dedicated thread polls the `ResilientConnection` and publishes every
//! decoded frame into a single-slot cell; `read()` just clones whatever is
//! there. When the connection is down the cell is emptied, so readers see
//! "no frame" instead of a frozen picture.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::cell::LatestCell;
use crate::frame::Frame;
use crate::ingest::{ConnectionStats, Poll, ResilientConnection};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct FrameSource {
    latest: Arc<LatestCell<Arc<Frame>>>,
    running: Arc<AtomicBool>,
    conn: Arc<Mutex<ResilientConnection>>,
    stats: Arc<Mutex<ConnectionStats>>,
    thread: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(conn: ResilientConnection) -> Self {
        Self {
            latest: Arc::new(LatestCell::new()),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(conn.stats())),
            conn: Arc::new(Mutex::new(conn)),
            thread: None,
        }
    }

    /// Start capturing. Calling while already running does nothing.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let latest = Arc::clone(&self.latest);
        let running = Arc::clone(&self.running);
        let conn = Arc::clone(&self.conn);
        let stats = Arc::clone(&self.stats);
        let handle = std::thread::Builder::new()
            .name("frame-source".into())
            .spawn(move || capture_loop(&conn, &latest, &running, &stats));
        match handle {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(err).context("spawn frame-source thread")
            }
        }
    }

    /// Stop capturing, close the connection and drop the held frame.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                log::error!("frame-source thread panicked");
            }
        }
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.disconnect();
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = conn.stats();
        drop(conn);
        self.latest.clear();
    }

    /// Most recent frame, or `None` while not connected. Never blocks on I/O.
    pub fn read(&self) -> Option<Arc<Frame>> {
        self.latest.latest()
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn stats(&self) -> ConnectionStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn capture_loop(
    conn: &Mutex<ResilientConnection>,
    latest: &LatestCell<Arc<Frame>>,
    running: &AtomicBool,
    stats: &Mutex<ConnectionStats>,
) {
    // Only this thread touches the connection while running.
    let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
    log::info!("frame source started: {}", conn.describe());
    let mut sequence = 0u64;
    let mut last_health = Instant::now();

    while running.load(Ordering::SeqCst) {
        match conn.poll() {
            Poll::Frame(image) => {
                sequence += 1;
                latest.publish(Arc::new(Frame::new(image, sequence)));
            }
            Poll::Pending => {}
            Poll::Backoff(delay) => {
                latest.clear();
                *stats.lock().unwrap_or_else(PoisonError::into_inner) = conn.stats();
                park_while_running(running, delay);
            }
        }
        *stats.lock().unwrap_or_else(PoisonError::into_inner) = conn.stats();

        if last_health.elapsed() >= HEALTH_LOG_INTERVAL {
            let s = conn.stats();
            log::info!(
                "frame source health: connected={} frames={} reconnects={} stalls={}",
                s.connected,
                s.frames,
                s.reconnects,
                s.stalls
            );
            last_health = Instant::now();
        }
    }
    log::info!("frame source stopped after {} frames", sequence);
}

/// Wait out a backoff delay; `stop()` unparks the thread to cut it short.
fn park_while_running(running: &AtomicBool, delay: Duration) {
    let deadline = Instant::now() + delay;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::park_timeout(deadline - now);
    }
}
