//! Single-slot "latest value" cell.
//!
//! Every hand-off between pipeline stages goes through one of these: the
//! producer overwrites the slot, consumers clone whatever is there. There is
//! no queue, so a slow consumer sees a stale value but never a backlog.
//!
//! Each cell carries its own lock. Readers clone under the lock and release
//! it immediately; nobody holds a cell lock across image or inference work.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Slot<T> {
    value: Option<T>,
    version: u64,
}

pub struct LatestCell<T> {
    slot: Mutex<Slot<T>>,
    changed: Condvar,
}

impl<T: Clone> LatestCell<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                version: 0,
            }),
            changed: Condvar::new(),
        }
    }

    /// Replace the held value and wake every waiter.
    pub fn publish(&self, value: T) {
        let mut slot = self.lock();
        slot.value = Some(value);
        slot.version += 1;
        drop(slot);
        self.changed.notify_all();
    }

    /// Empty the slot. The version still advances so waiters observe the change.
    pub fn clear(&self) {
        let mut slot = self.lock();
        if slot.value.take().is_some() {
            slot.version += 1;
        }
    }

    pub fn latest(&self) -> Option<T> {
        self.lock().value.clone()
    }

    pub fn latest_versioned(&self) -> Option<(u64, T)> {
        let slot = self.lock();
        slot.value.clone().map(|value| (slot.version, value))
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn is_empty(&self) -> bool {
        self.lock().value.is_none()
    }

    /// Block until a value newer than `seen` is present, or `timeout` elapses.
    pub fn wait_for_update(&self, seen: u64, timeout: Duration) -> Option<(u64, T)> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.version > seen {
                if let Some(value) = slot.value.clone() {
                    return Some((slot.version, value));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = self
                .changed
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    // Slot contents are plain values, so a panicked writer cannot leave them
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for LatestCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn latest_value_wins() {
        let cell = LatestCell::new();
        assert!(cell.latest().is_none());
        cell.publish(1u32);
        cell.publish(2u32);
        assert_eq!(cell.latest(), Some(2));
        assert_eq!(cell.version(), 2);
    }

    #[test]
    fn clear_empties_slot() {
        let cell = LatestCell::new();
        cell.publish("frame");
        cell.clear();
        assert!(cell.is_empty());
        assert!(cell.latest_versioned().is_none());
    }

    #[test]
    fn waiter_wakes_on_publish() {
        let cell = Arc::new(LatestCell::new());
        let producer = cell.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.publish(7u8);
        });
        let got = cell.wait_for_update(0, Duration::from_secs(5));
        handle.join().unwrap();
        assert_eq!(got, Some((1, 7)));
    }

    #[test]
    fn wait_times_out_without_newer_version() {
        let cell = LatestCell::new();
        cell.publish(3u8);
        let seen = cell.version();
        assert!(cell.wait_for_update(seen, Duration::from_millis(20)).is_none());
    }
}
