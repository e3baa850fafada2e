//! Background reclamation of trashed entries
//!
//! Soft delete only moves a subtree under the trash directory. The delete
//! worker wakes up on a signal or a periodic re-scan, purges file data and
//! removes trashed entries bottom-up in bounded batches.

use crate::data::DataManager;
use crate::events::{FsEvent, FsEventKind};
use crate::manager::{Listing, MetaManager};
use crate::metrics::LocalMetrics;
use crossbeam_channel::RecvTimeoutError;
use dashmap::DashMap;
use gridfs_common::config::DeleteWorkerConfig;
use gridfs_common::{Entry, EntryId, ListingEntry, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Waiters for the physical removal of trashed entries
#[derive(Default)]
pub struct DeleteTracker {
    waiters: DashMap<EntryId, Vec<oneshot::Sender<()>>>,
}

impl DeleteTracker {
    /// Receiver completed once `id` is purged.
    pub fn register(&self, id: EntryId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id).or_default().push(tx);
        rx
    }

    /// Wake everyone waiting for `id`.
    pub fn complete(&self, id: EntryId) {
        if let Some((_, senders)) = self.waiters.remove(&id) {
            for sender in senders {
                let _ = sender.send(());
            }
        }
    }

    /// Drop every waiter; their receivers observe cancellation.
    pub fn cancel_all(&self) {
        self.waiters.clear();
    }

    /// Number of entries somebody is waiting for
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

/// One pass over the trash directory
pub(crate) struct Sweeper {
    meta: Arc<MetaManager>,
    data: Arc<dyn DataManager>,
    tracker: Arc<DeleteTracker>,
    batch_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl Sweeper {
    /// Purge every trash child that can be purged now. Returns how many
    /// trash children were removed.
    pub(crate) fn sweep(&self) -> Result<usize> {
        let trash = self.meta.directory_listing(EntryId::TRASH)?;
        let mut purged = 0;

        for (name, entry) in &trash {
            if self.stopping() {
                break;
            }

            match self.purge(name, entry) {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to purge trashed entry {}: {}", entry.file_id, e),
            }
        }

        if purged > 0 {
            debug!("Delete worker purged {} trashed entries", purged);
        }
        Ok(purged)
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn purge(&self, name: &str, entry: &ListingEntry) -> Result<bool> {
        let Some(info) = self.meta.info(entry.file_id)? else {
            // Dangling trash reference
            let single = Listing::from([(name.to_string(), *entry)]);
            self.meta.delete_batch(EntryId::TRASH, &single, false)?;
            self.tracker.complete(entry.file_id);
            return Ok(true);
        };

        if info.is_file() {
            if info.is_locked() {
                debug!("Skipping trashed file {} (opened for writing)", info.id());
                return Ok(false);
            }
            self.data.delete(&info)?;
        } else if !self.delete_directory(&info)? {
            return Ok(false);
        }

        if !self.meta.delete_entry(EntryId::TRASH, name, info.id())? {
            return Ok(false);
        }

        if info.is_file() {
            LocalMetrics::incr(&self.meta.metrics.files_purged);
            if let Some(path) = info.path() {
                self.meta
                    .events()
                    .record(FsEvent::new(FsEventKind::FilePurged, path.clone()));
            }
        }
        self.tracker.complete(info.id());

        Ok(true)
    }

    /// Remove the content of `dir` bottom-up. Returns `true` once the
    /// directory is empty.
    fn delete_directory(&self, dir: &Entry) -> Result<bool> {
        let listing = self.meta.directory_listing(dir.id())?;

        let mut blocked = false;
        let mut batch = Listing::new();
        let mut files = HashSet::new();

        for (name, child) in listing {
            if self.stopping() {
                return Ok(false);
            }

            match self.meta.info(child.file_id)? {
                Some(info) if info.is_directory() => {
                    if !self.delete_directory(&info)? {
                        blocked = true;
                        continue;
                    }
                }
                Some(info) => {
                    if info.is_locked() {
                        blocked = true;
                        continue;
                    }
                    self.data.delete(&info)?;
                    files.insert(info.id());
                }
                None => {}
            }

            batch.insert(name, child);
            if batch.len() >= self.batch_size {
                self.flush(dir.id(), &mut batch, &files)?;
            }
        }
        self.flush(dir.id(), &mut batch, &files)?;

        Ok(!blocked && self.meta.directory_listing(dir.id())?.is_empty())
    }

    fn flush(&self, parent_id: EntryId, batch: &mut Listing, files: &HashSet<EntryId>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let reclaimed = self.meta.delete_batch(parent_id, batch, false)?;
        let purged_files = reclaimed.iter().filter(|id| files.contains(id)).count();
        LocalMetrics::add(&self.meta.metrics.files_purged, purged_files as u64);

        for id in reclaimed {
            self.tracker.complete(id);
        }
        batch.clear();
        Ok(())
    }
}

/// Background thread purging the trash directory
pub struct DeleteWorker {
    meta: Arc<MetaManager>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeleteWorker {
    /// Spawn the worker thread.
    pub fn start(
        meta: Arc<MetaManager>,
        data: Arc<dyn DataManager>,
        tracker: Arc<DeleteTracker>,
        config: &DeleteWorkerConfig,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let signal = meta.delete_signal();
        let interval = config.rescan_interval();

        let sweeper = Sweeper {
            meta: Arc::clone(&meta),
            data,
            tracker,
            batch_size: config.batch_size.max(1),
            shutdown: Arc::clone(&shutdown),
        };
        let flag = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("gridfs-delete-worker".to_string())
            .spawn(move || {
                info!("Delete worker started");

                while !flag.load(Ordering::Relaxed) {
                    match signal.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    if flag.load(Ordering::Relaxed) {
                        break;
                    }

                    if let Err(e) = sweeper.sweep() {
                        warn!("Delete worker sweep failed: {}", e);
                    }
                }

                info!("Delete worker stopped");
            })?;

        Ok(Self {
            meta,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the worker and wait for the thread to exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.meta.signal_delete_worker();

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for DeleteWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryDataManager;
    use crate::events::EventBus;
    use gridfs_common::{FsConfig, FsPath, Properties};
    use gridfs_meta_store::EntryStore;
    use std::time::Duration;

    struct Fixture {
        meta: Arc<MetaManager>,
        data: Arc<MemoryDataManager>,
        tracker: Arc<DeleteTracker>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                meta: Arc::new(MetaManager::new(
                    EntryStore::in_memory(),
                    &FsConfig::default(),
                    EventBus::new(),
                    Arc::new(LocalMetrics::default()),
                )),
                data: Arc::new(MemoryDataManager::default()),
                tracker: Arc::new(DeleteTracker::default()),
            }
        }

        fn sweeper(&self, batch_size: usize) -> Sweeper {
            Sweeper {
                meta: Arc::clone(&self.meta),
                data: self.data.clone(),
                tracker: Arc::clone(&self.tracker),
                batch_size,
                shutdown: Arc::new(AtomicBool::new(false)),
            }
        }

        fn add(&self, parent: EntryId, name: &str, entry: Entry) -> EntryId {
            let id = entry.id();
            assert!(self.meta.put_if_absent(parent, name, entry).unwrap().is_none());
            id
        }

        fn add_file(&self, parent: EntryId, name: &str) -> EntryId {
            let entry = Entry::file(4, 3, None, Properties::new());
            self.data.write(&entry, 0, b"abc").unwrap();
            self.add(parent, name, entry)
        }
    }

    fn dir() -> Entry {
        Entry::directory(Properties::new())
    }

    #[test]
    fn test_sweep_purges_subtree() {
        let fx = Fixture::new();
        let d = fx.add(EntryId::ROOT, "d", dir());
        let sub = fx.add(d, "sub", dir());
        let files: Vec<EntryId> = (0..5).map(|i| fx.add_file(sub, &format!("f{i}"))).collect();
        fx.add_file(d, "top");
        assert_eq!(fx.data.files(), 6);

        fx.meta.soft_delete(Some(EntryId::ROOT), Some("d"), d).unwrap();
        let done = fx.tracker.register(d);

        assert_eq!(fx.sweeper(2).sweep().unwrap(), 1);
        assert!(fx.meta.pending_deletes().unwrap().is_empty());
        assert_eq!(fx.data.files(), 0);
        assert!(!fx.meta.exists(d));
        assert!(!fx.meta.exists(sub));
        assert!(files.iter().all(|id| !fx.meta.exists(*id)));
        // Only the root and trash remain
        assert_eq!(fx.meta.store().len(), 2);
        assert_eq!(fx.meta.metrics.files_purged.load(Ordering::Relaxed), 6);
        assert!(done.blocking_recv().is_ok());
    }

    #[test]
    fn test_sweep_skips_locked_files() {
        let fx = Fixture::new();
        let d = fx.add(EntryId::ROOT, "d", dir());
        let busy = fx.add_file(d, "busy");
        let idle = fx.add_file(d, "idle");
        let locked = fx.meta.lock(busy).unwrap();

        fx.meta.soft_delete(Some(EntryId::ROOT), Some("d"), d).unwrap();
        assert_eq!(fx.sweeper(10).sweep().unwrap(), 0);

        assert!(fx.meta.exists(busy));
        assert!(!fx.meta.exists(idle));
        assert_eq!(fx.meta.pending_deletes().unwrap(), vec![d]);

        fx.meta.unlock(&locked, 1).unwrap();
        assert_eq!(fx.sweeper(10).sweep().unwrap(), 1);
        assert!(fx.meta.pending_deletes().unwrap().is_empty());
    }

    #[test]
    fn test_purged_file_records_event() {
        let fx = Fixture::new();
        let f = fx.add_file(EntryId::ROOT, "f");
        let path = FsPath::new("/f").unwrap();
        fx.meta
            .remove_if_empty(EntryId::ROOT, "f", f, &path, false)
            .unwrap()
            .unwrap();

        let mut rx = fx.meta.events().subscribe();
        assert_eq!(fx.sweeper(10).sweep().unwrap(), 1);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, FsEventKind::FilePurged);
        assert_eq!(event.path, path);
        assert!(!fx.data.contains(f));
    }

    #[test]
    fn test_worker_thread_reacts_to_signal() {
        let fx = Fixture::new();
        let d = fx.add(EntryId::ROOT, "d", dir());
        fx.add_file(d, "f");

        let config = DeleteWorkerConfig {
            rescan_interval_ms: 60_000,
            batch_size: 10,
        };
        let worker = DeleteWorker::start(
            Arc::clone(&fx.meta),
            fx.data.clone(),
            Arc::clone(&fx.tracker),
            &config,
        )
        .unwrap();
        assert!(worker.is_running());

        let done = fx.tracker.register(d);
        fx.meta.soft_delete(Some(EntryId::ROOT), Some("d"), d).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async { tokio::time::timeout(Duration::from_secs(10), done).await })
            .unwrap()
            .unwrap();

        assert!(!fx.meta.exists(d));
        worker.shutdown();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_tracker_completes_all_waiters() {
        let tracker = DeleteTracker::default();
        let id = EntryId::random();
        let a = tracker.register(id);
        let b = tracker.register(id);
        assert_eq!(tracker.pending(), 1);

        tracker.complete(id);
        assert!(a.blocking_recv().is_ok());
        assert!(b.blocking_recv().is_ok());
        assert_eq!(tracker.pending(), 0);
    }
}
