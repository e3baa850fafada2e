//! Transactional entry store.
//!
//! `EntryStore` maps entry IDs to immutable `Entry` records. Multi-key
//! changes go through a pessimistic, repeatable-read [`Tx`]: every key is
//! locked on first access and stays locked until the transaction is dropped.
//! Writes are buffered in the transaction and become visible atomically on
//! commit. Dropping an uncommitted transaction rolls it back.
//!
//! Single-key operations on the store itself run as implicit transactions.
//! Plain `get`/`get_all` read the latest committed state without locking.

use crate::lock::{LockTable, TxId};
use crate::persist::PersistentEntries;
use gridfs_common::config::StoreConfig;
use gridfs_common::{Entry, EntryId, Error, Result};
use parking_lot::RwLock;
use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

thread_local! {
    static TX_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

struct StoreInner {
    entries: RwLock<HashMap<EntryId, Entry>>,
    locks: LockTable,
    persist: Option<PersistentEntries>,
    tx_timeout: Duration,
    next_tx: AtomicU64,
}

/// Transactional map of entry ID to entry record
#[derive(Clone)]
pub struct EntryStore {
    inner: Arc<StoreInner>,
}

impl EntryStore {
    /// Open the store, loading persisted entries when a data path is set.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let mut entries = HashMap::new();

        let persist = match &config.data_path {
            Some(path) => {
                let persist = PersistentEntries::open(path)?;
                for entry in persist.load()? {
                    entries.insert(entry.id(), entry);
                }
                info!(
                    "Loaded {} entries from {}",
                    entries.len(),
                    path.display()
                );
                Some(persist)
            }
            None => None,
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(entries),
                locks: LockTable::default(),
                persist,
                tx_timeout: config.tx_timeout(),
                next_tx: AtomicU64::new(1),
            }),
        })
    }

    /// In-memory store with default settings
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: RwLock::new(HashMap::new()),
                locks: LockTable::default(),
                persist: None,
                tx_timeout: StoreConfig::default().tx_timeout(),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    /// Whether the calling thread has an open transaction.
    #[must_use]
    pub fn tx_active() -> bool {
        TX_ACTIVE.with(Cell::get)
    }

    /// Start a pessimistic repeatable-read transaction bound to this thread.
    pub fn tx_start(&self) -> Result<Tx<'_>> {
        if Self::tx_active() {
            return Err(Error::internal(
                "transaction already started on this thread",
            ));
        }
        TX_ACTIVE.with(|active| active.set(true));

        Ok(Tx {
            store: &self.inner,
            id: self.inner.next_tx.fetch_add(1, Ordering::Relaxed),
            locked: Vec::new(),
            writes: HashMap::new(),
            _thread_bound: PhantomData,
        })
    }

    /// Latest committed value
    #[must_use]
    pub fn get(&self, id: EntryId) -> Option<Entry> {
        self.inner.entries.read().get(&id).cloned()
    }

    /// Latest committed values of the IDs that exist
    #[must_use]
    pub fn get_all(&self, ids: &[EntryId]) -> HashMap<EntryId, Entry> {
        let entries = self.inner.entries.read();
        ids.iter()
            .filter_map(|id| entries.get(id).map(|e| (*id, e.clone())))
            .collect()
    }

    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.inner.entries.read().contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Store `entry` under its ID.
    pub fn put(&self, entry: Entry) -> Result<()> {
        let mut tx = self.tx_start()?;
        tx.put(entry)?;
        tx.commit()
    }

    /// Store `entry` unless its ID is taken; returns the existing value.
    pub fn put_if_absent(&self, entry: Entry) -> Result<Option<Entry>> {
        let mut tx = self.tx_start()?;
        let existing = tx.put_if_absent(entry)?;
        tx.commit()?;
        Ok(existing)
    }

    pub fn remove(&self, id: EntryId) -> Result<bool> {
        let mut tx = self.tx_start()?;
        let removed = tx.remove(id)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Replace the value when it still equals `expected`.
    pub fn replace(&self, expected: &Entry, new: Entry) -> Result<bool> {
        let mut tx = self.tx_start()?;
        let replaced = tx.replace(expected, new)?;
        tx.commit()?;
        Ok(replaced)
    }

    /// Atomic read-modify-write. Returns the new value, `None` when the
    /// entry does not exist.
    pub fn transform<F>(&self, id: EntryId, f: F) -> Result<Option<Entry>>
    where
        F: FnOnce(&Entry) -> Result<Entry>,
    {
        let mut tx = self.tx_start()?;
        let updated = tx.transform(id, f)?;
        tx.commit()?;
        Ok(updated)
    }
}

/// Pessimistic repeatable-read transaction
///
/// Keys are locked on first access and released when the transaction is
/// dropped, committed or not. A transaction cannot leave the thread that
/// started it.
pub struct Tx<'a> {
    store: &'a StoreInner,
    id: TxId,
    locked: Vec<EntryId>,
    writes: HashMap<EntryId, Option<Entry>>,
    _thread_bound: PhantomData<*const ()>,
}

impl Tx<'_> {
    fn lock(&mut self, id: EntryId) -> Result<()> {
        if self.store.locks.acquire(id, self.id, self.store.tx_timeout)? {
            self.locked.push(id);
        }
        Ok(())
    }

    fn read(&self, id: EntryId) -> Option<Entry> {
        match self.writes.get(&id) {
            Some(pending) => pending.clone(),
            None => self.store.entries.read().get(&id).cloned(),
        }
    }

    /// IDs locked by this transaction, in acquisition order
    #[must_use]
    pub fn locked_ids(&self) -> &[EntryId] {
        &self.locked
    }

    /// Read an entry as this transaction sees it, without locking it.
    #[must_use]
    pub fn peek(&self, id: EntryId) -> Option<Entry> {
        self.read(id)
    }

    /// Lock and read a single entry.
    pub fn get(&mut self, id: EntryId) -> Result<Option<Entry>> {
        self.lock(id)?;
        Ok(self.read(id))
    }

    /// Lock `ids` in the given order and read the ones that exist.
    pub fn get_all(&mut self, ids: &[EntryId]) -> Result<HashMap<EntryId, Entry>> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            self.lock(*id)?;
            if let Some(entry) = self.read(*id) {
                found.insert(*id, entry);
            }
        }
        Ok(found)
    }

    pub fn put(&mut self, entry: Entry) -> Result<()> {
        let id = entry.id();
        self.lock(id)?;
        self.writes.insert(id, Some(entry));
        Ok(())
    }

    /// Insert unless the ID is taken; returns the existing value.
    pub fn put_if_absent(&mut self, entry: Entry) -> Result<Option<Entry>> {
        let id = entry.id();
        self.lock(id)?;
        if let Some(existing) = self.read(id) {
            return Ok(Some(existing));
        }
        self.writes.insert(id, Some(entry));
        Ok(None)
    }

    pub fn remove(&mut self, id: EntryId) -> Result<bool> {
        self.lock(id)?;
        let existed = self.read(id).is_some();
        self.writes.insert(id, None);
        Ok(existed)
    }

    /// Replace the value when it still equals `expected`.
    pub fn replace(&mut self, expected: &Entry, new: Entry) -> Result<bool> {
        let id = expected.id();
        debug_assert_eq!(id, new.id(), "replace must keep the entry ID");

        self.lock(id)?;
        if self.read(id).as_ref() != Some(expected) {
            return Ok(false);
        }
        self.writes.insert(id, Some(new));
        Ok(true)
    }

    /// Apply `f` to the current value. Returns the new value, `None` when
    /// the entry does not exist.
    pub fn transform<F>(&mut self, id: EntryId, f: F) -> Result<Option<Entry>>
    where
        F: FnOnce(&Entry) -> Result<Entry>,
    {
        self.lock(id)?;
        let Some(current) = self.read(id) else {
            return Ok(None);
        };

        let updated = f(&current)?;
        if updated.id() != id {
            return Err(Error::inconsistent(format!(
                "transform changed entry ID from {id} to {}",
                updated.id()
            )));
        }

        self.writes.insert(id, Some(updated.clone()));
        Ok(Some(updated))
    }

    /// Persist and publish the buffered writes.
    pub fn commit(mut self) -> Result<()> {
        let writes: Vec<(EntryId, Option<Entry>)> = self.writes.drain().collect();
        if writes.is_empty() {
            return Ok(());
        }

        if let Some(persist) = &self.store.persist {
            persist.apply(&writes)?;
        }

        let mut entries = self.store.entries.write();
        for (id, entry) in writes {
            match entry {
                Some(entry) => {
                    entries.insert(id, entry);
                }
                None => {
                    entries.remove(&id);
                }
            }
        }
        drop(entries);

        debug!("Committed tx {} ({} locks)", self.id, self.locked.len());
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.writes.is_empty() {
            debug!("Rolling back tx {} ({} writes)", self.id, self.writes.len());
        }
        self.store.locks.release_all(self.id, &self.locked);
        TX_ACTIVE.with(|active| active.set(false));
    }
}
