//! All-time unique object counter.
//!
//! The total lives in memory and is the authority. Every positive increment
//! schedules a background save to a single-record JSON file
//! (`{"total": N}`); the hot path never waits on disk. A crash between an
//! increment and its save loses at most that unsaved delta.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub total: u64,
}

#[derive(Clone, Debug)]
pub struct HistoryStore {
    inner: Arc<HistoryInner>,
}

#[derive(Debug)]
struct HistoryInner {
    path: PathBuf,
    total: AtomicU64,
    /// Serialises file writes; each writer stores the newest total it sees.
    write_lock: Mutex<()>,
    pending: Mutex<usize>,
    drained: Condvar,
}

impl HistoryStore {
    /// Load the persisted total. A missing or unreadable file starts at zero.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let total = match read_record(&path) {
            Ok(Some(record)) => {
                log::info!("history loaded from {}: total={}", path.display(), record.total);
                record.total
            }
            Ok(None) => {
                log::info!("no history at {}; starting from 0", path.display());
                0
            }
            Err(err) => {
                log::warn!("ignoring unreadable history {}: {:#}", path.display(), err);
                0
            }
        };
        Self {
            inner: Arc::new(HistoryInner {
                path,
                total: AtomicU64::new(total),
                write_lock: Mutex::new(()),
                pending: Mutex::new(0),
                drained: Condvar::new(),
            }),
        }
    }

    pub fn total(&self) -> u64 {
        self.inner.total.load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Add `amount` and schedule a background save. Returns the new total.
    pub fn increment(&self, amount: u64) -> u64 {
        if amount == 0 {
            return self.total();
        }
        let total = self.inner.total.fetch_add(amount, Ordering::SeqCst) + amount;
        self.schedule_save();
        total
    }

    /// Write the current total synchronously.
    pub fn save_now(&self) -> Result<()> {
        self.inner.save()
    }

    /// Wait until no background save is in flight. Returns false on timeout.
    pub fn wait_for_saves(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pending = self
                .inner
                .drained
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn schedule_save(&self) {
        *self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("history-save".into())
            .spawn(move || {
                if let Err(err) = inner.save() {
                    log::warn!("history save failed: {:#}", err);
                }
                inner.finish_save();
            });
        if let Err(err) = spawned {
            log::warn!("could not schedule history save: {}", err);
            self.inner.finish_save();
        }
    }
}

impl HistoryInner {
    fn save(&self) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let record = HistoryRecord {
            total: self.total.load(Ordering::SeqCst),
        };
        write_record(&self.path, &record)
    }

    fn finish_save(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }
}

fn read_record(path: &Path) -> Result<Option<HistoryRecord>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("read history file"),
    };
    let record = serde_json::from_str(&raw).context("parse history file")?;
    Ok(Some(record))
}

fn write_record(path: &Path, record: &HistoryRecord) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create history dir {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec(record)?)
        .with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_starts_at_zero() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::load(dir.path().join("history.json"));
        assert_eq!(store.total(), 0);
    }

    #[test]
    fn corrupt_file_starts_at_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"{\"total\": \"lots\"").unwrap();
        assert_eq!(HistoryStore::load(&path).total(), 0);
    }

    #[test]
    fn increments_accumulate_and_persist() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("history.json");
        let store = HistoryStore::load(&path);
        assert_eq!(store.increment(5), 5);
        assert_eq!(store.increment(3), 8);
        assert_eq!(store.total(), 8);
        assert!(store.wait_for_saves(Duration::from_secs(5)));

        let record: HistoryRecord = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(record, HistoryRecord { total: 8 });
        assert_eq!(HistoryStore::load(&path).total(), 8);
        Ok(())
    }

    #[test]
    fn zero_increment_is_a_no_op() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let store = HistoryStore::load(&path);
        assert_eq!(store.increment(0), 0);
        assert!(store.wait_for_saves(Duration::from_secs(1)));
        assert!(!path.exists());
    }

    #[test]
    fn save_creates_missing_parent_dirs() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("state").join("history.json");
        let store = HistoryStore::load(&path);
        store.increment(2);
        store.save_now()?;
        assert_eq!(HistoryStore::load(&path).total(), 2);
        assert!(store.wait_for_saves(Duration::from_secs(5)));
        Ok(())
    }
}
