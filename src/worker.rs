//! Detection thread.
//!
//! Each cycle takes the newest prepared frame from the inference cell, runs
//! the detector once, counts ids that were not present last cycle, and
//! publishes boxes for the compositor and counts for the stats board. While
//! the activity gate is closed it never touches the model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::activity::ActivityGate;
use crate::cell::LatestCell;
use crate::counter::TrackedIdRegistry;
use crate::detect::{Detection, DetectionSet, DetectorBackend};
use crate::frame::Frame;
use crate::history::HistoryStore;
use crate::stats::{event_line, StatsBoard};

pub type BoxList = Arc<Vec<Detection>>;

/// Sleep between idle checks.
pub const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Gate closed; nothing ran.
    Idle,
    /// Active but no frame available.
    NoFrame,
    /// The newest frame was already processed.
    Stale,
    Detected { new_objects: u64 },
    Failed,
}

/// Shared cells the worker reads from and writes to.
#[derive(Clone)]
pub struct WorkerChannels {
    pub gate: Arc<ActivityGate>,
    pub input: Arc<LatestCell<Arc<Frame>>>,
    pub boxes: Arc<LatestCell<BoxList>>,
    pub board: Arc<StatsBoard>,
    pub history: HistoryStore,
}

pub struct DetectionWorker {
    channels: WorkerChannels,
    backend: Box<dyn DetectorBackend>,
    registry: TrackedIdRegistry,
    interval: Duration,
    last_version: u64,
    was_active: bool,
}

impl DetectionWorker {
    pub fn new(
        channels: WorkerChannels,
        backend: Box<dyn DetectorBackend>,
        interval: Duration,
    ) -> Self {
        Self {
            channels,
            backend,
            registry: TrackedIdRegistry::new(),
            interval,
            last_version: 0,
            was_active: false,
        }
    }

    pub fn run_cycle(&mut self) -> CycleOutcome {
        let ch = &self.channels;
        if !ch.gate.is_active() {
            if self.was_active {
                log::info!("detection suspended: no viewers");
                self.was_active = false;
            }
            ch.boxes.clear();
            ch.board.set_idle();
            return CycleOutcome::Idle;
        }
        if !self.was_active {
            log::info!("detection resumed ({})", self.backend.name());
            self.was_active = true;
        }

        let Some((version, frame)) = ch.input.latest_versioned() else {
            ch.board.set_no_frame();
            return CycleOutcome::NoFrame;
        };
        if version == self.last_version {
            return CycleOutcome::Stale;
        }
        self.last_version = version;

        let detections = match self.backend.detect(&frame) {
            Ok(detections) => detections,
            Err(err) => {
                // Previous boxes stay up until the next good cycle.
                log::warn!("detection failed on frame {}: {:#}", frame.sequence, err);
                return CycleOutcome::Failed;
            }
        };

        let set = DetectionSet::new(detections);
        let new_objects = self.registry.observe(set.track_ids());
        if new_objects > 0 {
            let total = ch.history.increment(new_objects);
            log::debug!("{} new object(s), total {}", new_objects, total);
        }
        ch.board.record_cycle(set.counts, event_line(&set.counts));
        ch.boxes.publish(Arc::new(set.detections));
        CycleOutcome::Detected { new_objects }
    }

    /// Loop until `shutdown` is set.
    pub fn run(mut self, shutdown: &AtomicBool) {
        if let Err(err) = self.backend.warm_up() {
            log::warn!("detector warm-up failed: {:#}", err);
        }
        log::info!(
            "detection worker started: backend={} interval={:?}",
            self.backend.name(),
            self.interval
        );
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            match self.run_cycle() {
                CycleOutcome::Idle => nap(shutdown, IDLE_POLL),
                CycleOutcome::NoFrame | CycleOutcome::Stale => {
                    // Wake as soon as the compositor publishes a new frame.
                    let _ = self
                        .channels
                        .input
                        .wait_for_update(self.last_version, self.interval);
                }
                CycleOutcome::Detected { .. } | CycleOutcome::Failed => {
                    nap(shutdown, self.interval.saturating_sub(started.elapsed()));
                }
            }
        }
        log::info!("detection worker stopped");
    }
}

/// Sleep in short slices so shutdown is noticed promptly.
pub(crate) fn nap(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
