//! Viewer activity tracking.
//!
//! Capture and inference cost money (camera bandwidth, CPU/accelerator time)
//! and are pointless with nobody watching. `ActivityGate` records when the
//! last stream or stats request arrived and how many video viewers are
//! connected; the render and detection loops consult `is_active()` before
//! doing any expensive work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct ActivityGate {
    idle_timeout: Duration,
    last_request: Mutex<Option<Instant>>,
    viewers: AtomicUsize,
}

impl ActivityGate {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            last_request: Mutex::new(None),
            viewers: AtomicUsize::new(0),
        }
    }

    /// Record an inbound request.
    pub fn touch(&self) {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Register a connected video viewer. The count drops again when the
    /// returned guard is dropped, on every exit path including unwinding.
    pub fn viewer_connected(self: &Arc<Self>) -> ViewerGuard {
        self.touch();
        let count = self.viewers.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("viewer connected ({} active)", count);
        ViewerGuard {
            gate: Arc::clone(self),
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::SeqCst)
    }

    /// Time since the last request, `None` if no request has arrived yet.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed())
    }

    pub fn is_active(&self) -> bool {
        if self.viewer_count() > 0 {
            return true;
        }
        matches!(self.idle_for(), Some(idle) if idle < self.idle_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl Default for ActivityGate {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

/// Keeps one viewer registered on the gate while alive.
#[derive(Debug)]
pub struct ViewerGuard {
    gate: Arc<ActivityGate>,
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let remaining = self.gate.viewers.fetch_sub(1, Ordering::SeqCst) - 1;
        // The idle window starts when the last viewer leaves.
        self.gate.touch();
        log::debug!("viewer disconnected ({} active)", remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_before_any_request() {
        let gate = ActivityGate::new(Duration::from_secs(60));
        assert!(!gate.is_active());
        assert!(gate.idle_for().is_none());
    }

    #[test]
    fn touch_keeps_gate_active_within_timeout() {
        let gate = ActivityGate::new(Duration::from_secs(60));
        gate.touch();
        assert!(gate.is_active());
    }

    #[test]
    fn touch_expires_after_timeout() {
        let gate = ActivityGate::new(Duration::from_millis(10));
        gate.touch();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!gate.is_active());
    }

    #[test]
    fn connected_viewer_keeps_gate_active_past_timeout() {
        let gate = Arc::new(ActivityGate::new(Duration::from_millis(10)));
        let guard = gate.viewer_connected();
        std::thread::sleep(Duration::from_millis(30));
        assert!(gate.is_active());
        drop(guard);
        assert_eq!(gate.viewer_count(), 0);
    }

    #[test]
    fn guard_releases_viewer_on_panic() {
        let gate = Arc::new(ActivityGate::default());
        let thread_gate = gate.clone();
        let result = std::thread::spawn(move || {
            let _guard = thread_gate.viewer_connected();
            panic!("client handler crashed");
        })
        .join();
        assert!(result.is_err());
        assert_eq!(gate.viewer_count(), 0);
    }
}
