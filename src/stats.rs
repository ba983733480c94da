//! Stats snapshot served at `/api/stats`.
//!
//! The wire schema is fixed: every class key is always present, followed by
//! `status`, `total_all_time` and, once something has been seen, `log`.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::activity::ActivityGate;
use crate::detect::ClassCounts;
use crate::history::HistoryStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    Starting,
    Idle,
    Live,
    /// Active, but the camera is not delivering frames.
    Reconnecting,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub counts: ClassCounts,
    pub status: Status,
    pub total_all_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            counts: ClassCounts::default(),
            status: Status::Starting,
            total_all_time: 0,
            log: None,
        }
    }
}

/// Latest per-cycle stats, written by the detection worker.
#[derive(Debug, Default)]
pub struct StatsBoard {
    current: Mutex<StatsSnapshot>,
}

impl StatsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: Status) {
        self.lock().status = status;
    }

    /// Suspended: no live counts.
    pub fn set_idle(&self) {
        let mut current = self.lock();
        current.status = Status::Idle;
        current.counts = ClassCounts::default();
    }

    /// Camera unavailable. Stays `Starting` until the first live cycle.
    pub fn set_no_frame(&self) {
        let mut current = self.lock();
        if current.status != Status::Starting {
            current.status = Status::Reconnecting;
        }
        current.counts = ClassCounts::default();
    }

    /// Record a completed inference cycle. `log` replaces the previous event
    /// line only when present.
    pub fn record_cycle(&self, counts: ClassCounts, log: Option<String>) {
        let mut current = self.lock();
        current.status = Status::Live;
        current.counts = counts;
        if log.is_some() {
            current.log = log;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, StatsSnapshot> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read side of the stats. Every read counts as activity.
#[derive(Clone)]
pub struct StatsEndpoint {
    board: Arc<StatsBoard>,
    history: HistoryStore,
    gate: Arc<ActivityGate>,
}

impl StatsEndpoint {
    pub fn new(board: Arc<StatsBoard>, history: HistoryStore, gate: Arc<ActivityGate>) -> Self {
        Self {
            board,
            history,
            gate,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.gate.touch();
        StatsSnapshot {
            total_all_time: self.history.total(),
            ..self.board.snapshot()
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.snapshot()).context("serialize stats snapshot")
    }
}

/// Event line for a cycle, e.g. `[14:03:07] 2 CAR, 1 TRUCK`.
pub fn event_line(counts: &ClassCounts) -> Option<String> {
    if counts.is_empty() {
        return None;
    }
    Some(format!(
        "[{}] {}",
        chrono::Local::now().format("%H:%M:%S"),
        counts.summary()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;
    use serde_json::Value;

    fn endpoint(dir: &tempfile::TempDir) -> (StatsEndpoint, Arc<StatsBoard>, Arc<ActivityGate>) {
        let board = Arc::new(StatsBoard::new());
        let gate = Arc::new(ActivityGate::default());
        let history = HistoryStore::load(dir.path().join("history.json"));
        (
            StatsEndpoint::new(board.clone(), history, gate.clone()),
            board,
            gate,
        )
    }

    #[test]
    fn json_has_fixed_schema() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (endpoint, _, _) = endpoint(&dir);
        let value: Value = serde_json::from_str(&endpoint.to_json()?)?;
        for class in ObjectClass::ALL {
            assert_eq!(value[class.label()], 0);
        }
        assert_eq!(value["status"], "Starting");
        assert_eq!(value["total_all_time"], 0);
        assert!(value.get("log").is_none());
        Ok(())
    }

    #[test]
    fn snapshot_touches_gate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (endpoint, _, gate) = endpoint(&dir);
        assert!(!gate.is_active());
        endpoint.snapshot();
        assert!(gate.is_active());
        Ok(())
    }

    #[test]
    fn log_line_survives_empty_cycles() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (endpoint, board, _) = endpoint(&dir);
        let mut counts = ClassCounts::default();
        counts.add(ObjectClass::Car);
        counts.add(ObjectClass::Car);
        counts.add(ObjectClass::Truck);
        board.record_cycle(counts, event_line(&counts));
        board.record_cycle(ClassCounts::default(), None);

        let snapshot = endpoint.snapshot();
        assert_eq!(snapshot.status, Status::Live);
        assert_eq!(snapshot.counts.car, 0);
        let log = snapshot.log.expect("log retained");
        assert!(log.ends_with("] 2 CAR, 1 TRUCK"));
        Ok(())
    }

    #[test]
    fn no_frame_keeps_starting_until_first_cycle() {
        let board = StatsBoard::new();
        board.set_no_frame();
        assert_eq!(board.snapshot().status, Status::Starting);
        board.record_cycle(ClassCounts::default(), None);
        board.set_no_frame();
        assert_eq!(board.snapshot().status, Status::Reconnecting);
    }
}
