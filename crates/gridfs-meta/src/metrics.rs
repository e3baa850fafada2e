//! Local operation counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of operations served by this instance
#[derive(Debug, Default)]
pub struct LocalMetrics {
    pub files_opened_for_read: AtomicU64,
    pub files_opened_for_write: AtomicU64,
    pub files_created: AtomicU64,
    pub dirs_created: AtomicU64,
    pub renames: AtomicU64,
    pub deletes: AtomicU64,
    pub files_purged: AtomicU64,
    pub sync_restarts: AtomicU64,
}

/// Point-in-time copy of [`LocalMetrics`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub files_opened_for_read: u64,
    pub files_opened_for_write: u64,
    pub files_created: u64,
    pub dirs_created: u64,
    pub renames: u64,
    pub deletes: u64,
    pub files_purged: u64,
    pub sync_restarts: u64,
}

impl LocalMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Decrement a gauge, saturating at zero
    pub fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            files_opened_for_read: self.files_opened_for_read.load(Ordering::Relaxed),
            files_opened_for_write: self.files_opened_for_write.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            files_purged: self.files_purged.load(Ordering::Relaxed),
            sync_restarts: self.sync_restarts.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.files_opened_for_read,
            &self.files_opened_for_write,
            &self.files_created,
            &self.dirs_created,
            &self.renames,
            &self.deletes,
            &self.files_purged,
            &self.sync_restarts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
