//! Namespace metadata manager
//!
//! The namespace is a graph of immutable entries addressed by ID. A
//! directory's listing maps child names to child IDs; parents are never
//! stored on the child and are derived by walking from the root.
//!
//! Every change that touches more than one entry runs in a pessimistic
//! store transaction. All IDs a transaction locks are acquired in ascending
//! order through [`MetaManager::lock_ids`], which keeps overlapping
//! transactions free of circular waits. Methods suffixed `_in` join a
//! caller-managed transaction; the others open their own.

use crate::events::EventBus;
use crate::metrics::LocalMetrics;
use crate::update::EntryUpdate;
use crossbeam_channel::{Receiver, Sender, bounded};
use gridfs_common::config::{FsConfig, SyncConfig};
use gridfs_common::{
    Entry, EntryId, Error, FsPath, ListingEntry, Properties, PropertyUpdates, Result,
};
use gridfs_meta_store::{EntryStore, Tx};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Directory listing: child name to child reference
pub type Listing = BTreeMap<String, ListingEntry>;

/// Transactional namespace tree over the entry store
pub struct MetaManager {
    pub(crate) store: EntryStore,
    pub(crate) block_size: u32,
    pub(crate) sync: SyncConfig,
    pub(crate) events: EventBus,
    pub(crate) metrics: Arc<LocalMetrics>,
    delete_tx: Sender<()>,
    delete_rx: Receiver<()>,
}

impl MetaManager {
    pub fn new(
        store: EntryStore,
        config: &FsConfig,
        events: EventBus,
        metrics: Arc<LocalMetrics>,
    ) -> Self {
        let (delete_tx, delete_rx) = bounded(1);

        Self {
            store,
            block_size: config.block_size,
            sync: config.sync.clone(),
            events,
            metrics,
            delete_tx,
            delete_rx,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &EntryStore {
        &self.store
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    // ---- Delete worker signal ----

    /// Wake the delete worker. A pending signal absorbs new ones.
    pub fn signal_delete_worker(&self) {
        let _ = self.delete_tx.try_send(());
    }

    /// Receiving side of the delete worker signal
    #[must_use]
    pub fn delete_signal(&self) -> Receiver<()> {
        self.delete_rx.clone()
    }

    /// Consume a pending signal without blocking.
    #[must_use]
    pub fn take_delete_signal(&self) -> bool {
        self.delete_rx.try_recv().is_ok()
    }

    // ---- Resolution (committed reads) ----

    fn committed_root(&self) -> Result<Entry> {
        if let Some(root) = self.store.get(EntryId::ROOT) {
            return Ok(root);
        }

        // The caller's transaction materializes the root when it locks it
        if EntryStore::tx_active() {
            return Ok(Entry::root());
        }

        let root = Entry::root();
        Ok(self.store.put_if_absent(root.clone())?.unwrap_or(root))
    }

    /// Committed entry, creating the root on first access.
    pub fn info(&self, id: EntryId) -> Result<Option<Entry>> {
        if id.is_root() {
            return self.committed_root().map(Some);
        }
        Ok(self.store.get(id))
    }

    /// Committed entries of the IDs that exist.
    pub fn infos(&self, ids: &[EntryId]) -> Result<HashMap<EntryId, Entry>> {
        let mut infos = self.store.get_all(ids);
        if ids.contains(&EntryId::ROOT) && !infos.contains_key(&EntryId::ROOT) {
            infos.insert(EntryId::ROOT, self.committed_root()?);
        }
        Ok(infos)
    }

    #[must_use]
    pub fn exists(&self, id: EntryId) -> bool {
        id.is_root() || self.store.contains(id)
    }

    /// ID of `name` inside the directory `parent_id`
    pub fn file_id_in(&self, parent_id: EntryId, name: &str) -> Result<Option<EntryId>> {
        Ok(self
            .info(parent_id)?
            .and_then(|parent| parent.listing_entry(name).map(|e| e.file_id)))
    }

    /// ID of the last component of `path`
    pub fn file_id(&self, path: &FsPath) -> Result<Option<EntryId>> {
        Ok(self.file_ids(path)?.last().copied().flatten())
    }

    /// Committed entry at `path`
    pub fn info_at(&self, path: &FsPath) -> Result<Option<Entry>> {
        match self.file_id(path)? {
            Some(id) => self.info(id),
            None => Ok(None),
        }
    }

    /// IDs of the root and every component of `path`.
    ///
    /// The result always has `depth + 1` elements. Once a component cannot
    /// be resolved it and everything after it is `None`.
    pub fn file_ids(&self, path: &FsPath) -> Result<Vec<Option<EntryId>>> {
        let components = path.components();
        let mut ids = Vec::with_capacity(components.len() + 1);
        ids.push(Some(EntryId::ROOT));

        let mut parent = Some(self.committed_root()?);
        let last = components.len().saturating_sub(1);

        for (idx, name) in components.into_iter().enumerate() {
            let id = parent
                .as_ref()
                .and_then(|p| p.listing_entry(name))
                .map(|e| e.file_id);
            ids.push(id);

            parent = match id {
                Some(id) if idx < last => self.store.get(id),
                _ => None,
            };
        }

        Ok(ids)
    }

    /// Listing of a directory, empty for files and missing entries
    pub fn directory_listing(&self, id: EntryId) -> Result<Listing> {
        Ok(self
            .info(id)?
            .and_then(|e| e.listing().cloned())
            .unwrap_or_default())
    }

    /// IDs of the entries waiting in trash for reclamation
    pub fn pending_deletes(&self) -> Result<Vec<EntryId>> {
        Ok(self
            .store
            .get(EntryId::TRASH)
            .and_then(|trash| trash.listing().map(|l| l.values().map(|e| e.file_id).collect()))
            .unwrap_or_default())
    }

    // ---- Locking ----

    /// Lock `ids` in ascending order and return the entries that exist.
    ///
    /// The root is materialized when requested and missing; any other
    /// missing ID is left out of the result.
    pub fn lock_ids(&self, tx: &mut Tx<'_>, ids: &[EntryId]) -> Result<HashMap<EntryId, Entry>> {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        debug!("Locking file ids: {:?}", ids);

        let mut infos = tx.get_all(&ids)?;

        if ids.contains(&EntryId::ROOT) && !infos.contains_key(&EntryId::ROOT) {
            let root = Entry::root();
            tx.put(root.clone())?;
            infos.insert(EntryId::ROOT, root);
        }

        debug!("Locked file ids: {:?}", ids);
        Ok(infos)
    }

    fn ensure_trash(tx: &mut Tx<'_>) -> Result<()> {
        if tx.get(EntryId::TRASH)?.is_none() {
            tx.put(Entry::trash())?;
        }
        Ok(())
    }

    /// Copy of `info` holding a fresh writer lock.
    pub fn lock_info(info: &Entry) -> Result<Entry> {
        if let Some(lock_id) = info.lock_id() {
            return Err(Error::FileLocked(format!(
                "file {} is already locked by {lock_id}",
                info.id()
            )));
        }
        Ok(info.with_lock(Some(Uuid::new_v4())))
    }

    /// Take the writer lock of a file.
    pub fn lock(&self, id: EntryId) -> Result<Entry> {
        let mut tx = self.store.tx_start()?;

        let info = tx
            .get(id)?
            .ok_or_else(|| Error::not_found(format!("failed to lock file (not found): {id}")))?;
        let locked = Self::lock_info(&info)?;
        tx.put(locked.clone())?;
        tx.commit()?;

        debug!("Locked file {} with lock {:?}", id, locked.lock_id());
        Ok(locked)
    }

    /// Release the writer lock held through `info`.
    pub fn unlock(&self, info: &Entry, modification_time: i64) -> Result<Entry> {
        let mut tx = self.store.tx_start()?;

        let current = tx.get(info.id())?.ok_or_else(|| {
            Error::not_found(format!("failed to unlock file (not found): {}", info.id()))
        })?;
        if info.lock_id().is_none() || current.lock_id() != info.lock_id() {
            return Err(Error::inconsistent(format!(
                "failed to unlock file {} (lock {:?}, expected {:?})",
                info.id(),
                current.lock_id(),
                info.lock_id()
            )));
        }

        let unlocked = current
            .with_lock(None)
            .with_times(current.access_time(), modification_time);
        tx.put(unlocked.clone())?;
        tx.commit()?;
        Ok(unlocked)
    }

    // ---- Creation ----

    /// Add `entry` as `name` under `parent_id` unless the name is taken.
    ///
    /// Returns `None` when the entry was added and the existing child when
    /// another creator won.
    pub fn put_if_absent_in(
        &self,
        tx: &mut Tx<'_>,
        parent_id: EntryId,
        name: &str,
        entry: Entry,
    ) -> Result<Option<Entry>> {
        debug_assert!(EntryStore::tx_active());
        FsPath::validate_name(name)?;

        let parent = self
            .lock_ids(tx, &[parent_id])?
            .remove(&parent_id)
            .ok_or_else(|| {
                Error::not_found(format!("failed to lock parent directory: {parent_id}"))
            })?;

        let Some(listing) = parent.listing() else {
            return Err(Error::ParentNotDirectory(format!(
                "parent {parent_id} of '{name}' is not a directory"
            )));
        };

        // Read without locking: the child may sort below the locked parent
        if let Some(existing) = listing.get(name) {
            let existing_info = tx.peek(existing.file_id).ok_or_else(|| {
                Error::inconsistent(format!(
                    "listing of {parent_id} references missing entry {} as '{name}'",
                    existing.file_id
                ))
            })?;
            return Ok(Some(existing_info));
        }

        let listing_entry = ListingEntry::from(&entry);
        if tx.put_if_absent(entry)?.is_some() {
            return Err(Error::inconsistent(format!(
                "entry {} already exists",
                listing_entry.file_id
            )));
        }

        let update = EntryUpdate::AddListing {
            name: name.to_string(),
            entry: listing_entry,
        };
        tx.transform(parent_id, |p| update.apply(p))?;

        Ok(None)
    }

    /// Standalone transaction around [`Self::put_if_absent_in`].
    pub fn put_if_absent(
        &self,
        parent_id: EntryId,
        name: &str,
        entry: Entry,
    ) -> Result<Option<Entry>> {
        let mut tx = self.store.tx_start()?;
        let existing = self.put_if_absent_in(&mut tx, parent_id, name, entry)?;
        tx.commit()?;
        Ok(existing)
    }

    // ---- Move ----

    /// Move `file_id` from `src_parent_id/src_name` to
    /// `dest_parent_id/dest_name` inside the caller's transaction.
    ///
    /// An existing destination name is never overwritten.
    pub fn move_in(
        &self,
        tx: &mut Tx<'_>,
        file_id: EntryId,
        src_name: &str,
        src_parent_id: EntryId,
        dest_name: &str,
        dest_parent_id: EntryId,
    ) -> Result<()> {
        debug_assert!(EntryStore::tx_active());

        if src_parent_id == dest_parent_id && src_name == dest_name {
            return Ok(());
        }

        let infos = self.lock_ids(tx, &[src_parent_id, file_id, dest_parent_id])?;

        let src_parent = infos.get(&src_parent_id).ok_or_else(|| {
            Error::not_found(format!("failed to lock source directory: {src_parent_id}"))
        })?;
        if !src_parent.is_directory() {
            return Err(Error::invalid_path(format!(
                "source parent is not a directory: {src_parent_id}"
            )));
        }

        let dest_parent = infos.get(&dest_parent_id).ok_or_else(|| {
            Error::not_found(format!(
                "failed to lock destination directory: {dest_parent_id}"
            ))
        })?;
        if !dest_parent.is_directory() {
            return Err(Error::invalid_path(format!(
                "destination parent is not a directory: {dest_parent_id}"
            )));
        }

        if !infos.contains_key(&file_id) {
            return Err(Error::not_found(format!(
                "failed to lock target file: {file_id}"
            )));
        }

        let src_entry = src_parent
            .listing_entry(src_name)
            .filter(|e| e.file_id == file_id)
            .copied()
            .ok_or_else(|| {
                Error::not_found(format!(
                    "'{src_name}' in {src_parent_id} no longer refers to {file_id}"
                ))
            })?;

        let dest_taken = if src_parent_id == dest_parent_id {
            src_parent.listing_entry(dest_name).is_some()
        } else {
            dest_parent.listing_entry(dest_name).is_some()
        };
        if dest_taken {
            return Err(Error::already_exists(format!(
                "'{dest_name}' already exists in {dest_parent_id}"
            )));
        }

        debug!(
            "Moving {} from {}/{} to {}/{}",
            file_id, src_parent_id, src_name, dest_parent_id, dest_name
        );

        let remove = EntryUpdate::RemoveListing {
            name: src_name.to_string(),
            entry: src_entry,
        };
        tx.transform(src_parent_id, |p| remove.apply(p))?;

        let add = EntryUpdate::AddListing {
            name: dest_name.to_string(),
            entry: src_entry,
        };
        tx.transform(dest_parent_id, |p| add.apply(p))?;

        Ok(())
    }

    /// Standalone transaction around [`Self::move_in`].
    pub fn move_entry(
        &self,
        file_id: EntryId,
        src_name: &str,
        src_parent_id: EntryId,
        dest_name: &str,
        dest_parent_id: EntryId,
    ) -> Result<()> {
        if src_parent_id == dest_parent_id && src_name == dest_name {
            return Ok(());
        }

        let mut tx = self.store.tx_start()?;
        self.move_in(
            &mut tx,
            file_id,
            src_name,
            src_parent_id,
            dest_name,
            dest_parent_id,
        )?;
        tx.commit()
    }

    // ---- Soft delete ----

    /// Move a subtree into trash inside the caller's transaction.
    ///
    /// With no parent the root is wiped: its whole listing is moved into a
    /// new directory under trash. Returns the ID of the new trash child,
    /// `None` when there was nothing to delete.
    pub fn soft_delete_in(
        &self,
        tx: &mut Tx<'_>,
        parent_id: Option<EntryId>,
        name: Option<&str>,
        id: EntryId,
    ) -> Result<Option<EntryId>> {
        debug_assert!(EntryStore::tx_active());

        let Some(parent_id) = parent_id else {
            if !id.is_root() {
                return Err(Error::invalid_argument(format!(
                    "soft delete of {id} requires a parent"
                )));
            }
            return self.soft_delete_root(tx);
        };

        let name = name.ok_or_else(|| {
            Error::invalid_argument(format!("soft delete of {id} requires a name"))
        })?;

        Self::ensure_trash(tx)?;
        self.move_in(tx, id, name, parent_id, &id.to_string(), EntryId::TRASH)?;

        Ok(Some(id))
    }

    fn soft_delete_root(&self, tx: &mut Tx<'_>) -> Result<Option<EntryId>> {
        let Some(root) = tx.get(EntryId::ROOT)? else {
            return Ok(None);
        };

        Self::ensure_trash(tx)?;

        let listing = root.listing().cloned().unwrap_or_default();
        if listing.is_empty() {
            return Ok(None);
        }

        let child_ids: Vec<EntryId> = listing.values().map(|e| e.file_id).collect();
        self.lock_ids(tx, &child_ids)?;

        let holder = Entry::directory_with_id(EntryId::random(), listing, Properties::new());
        tx.put(holder.clone())?;

        let add = EntryUpdate::AddListing {
            name: holder.id().to_string(),
            entry: ListingEntry::from(&holder),
        };
        tx.transform(EntryId::TRASH, |t| add.apply(t))?;
        tx.put(root.with_listing(Listing::new()))?;

        debug!("Moved root listing to trash as {}", holder.id());
        Ok(Some(holder.id()))
    }

    /// Move a subtree into trash and wake the delete worker.
    pub fn soft_delete(
        &self,
        parent_id: Option<EntryId>,
        name: Option<&str>,
        id: EntryId,
    ) -> Result<Option<EntryId>> {
        let mut tx = self.store.tx_start()?;

        match parent_id {
            Some(parent_id) => self.lock_ids(&mut tx, &[parent_id, id, EntryId::TRASH])?,
            None => self.lock_ids(&mut tx, &[id, EntryId::TRASH])?,
        };

        let trashed = self.soft_delete_in(&mut tx, parent_id, name, id)?;
        tx.commit()?;

        self.signal_delete_worker();
        Ok(trashed)
    }

    /// Remove a file or an empty directory by moving it into trash.
    ///
    /// Returns the removed entry tagged with `path`, or `None` when the
    /// entry or its parent is gone or the name was re-pointed concurrently.
    pub fn remove_if_empty_in(
        &self,
        tx: &mut Tx<'_>,
        parent_id: EntryId,
        name: &str,
        id: EntryId,
        path: &FsPath,
        remove_locked: bool,
    ) -> Result<Option<Entry>> {
        debug_assert!(EntryStore::tx_active());
        debug_assert!(!id.is_root());

        debug!("Remove file: parent={}, name={}, id={}", parent_id, name, id);

        let infos = self.lock_ids(tx, &[parent_id, id, EntryId::TRASH])?;

        let (Some(info), Some(parent)) = (infos.get(&id), infos.get(&parent_id)) else {
            if let Some(parent) = infos.get(&parent_id)
                && parent.listing_entry(name).is_some_and(|e| e.file_id == id)
            {
                return Err(Error::inconsistent(format!(
                    "'{name}' in {parent_id} references missing entry {id}"
                )));
            }
            return Ok(None);
        };

        if !remove_locked && info.is_locked() {
            return Err(Error::FileLocked(format!(
                "failed to remove '{name}' ({id}): file is opened for writing"
            )));
        }

        if info.listing().is_some_and(|l| !l.is_empty()) {
            return Err(Error::DirectoryNotEmpty(path.to_string()));
        }

        if !parent.listing_entry(name).is_some_and(|e| e.file_id == id) {
            return Ok(None);
        }

        self.soft_delete_in(tx, Some(parent_id), Some(name), id)?;

        let update = EntryUpdate::Path(path.clone());
        tx.transform(id, |e| update.apply(e))
    }

    /// Standalone transaction around [`Self::remove_if_empty_in`].
    pub fn remove_if_empty(
        &self,
        parent_id: EntryId,
        name: &str,
        id: EntryId,
        path: &FsPath,
        remove_locked: bool,
    ) -> Result<Option<Entry>> {
        let mut tx = self.store.tx_start()?;
        let removed = self.remove_if_empty_in(&mut tx, parent_id, name, id, path, remove_locked)?;
        tx.commit()?;

        self.signal_delete_worker();
        Ok(removed)
    }

    // ---- Hard delete ----

    /// Reclaim a batch of children of `parent_id`.
    ///
    /// Files and empty directories are removed together with their listing
    /// entries; children that are already gone are dropped from the
    /// listing. Non-empty directories and, unless `force` is set, files
    /// holding a writer lock are left in place. Returns the IDs reclaimed.
    pub fn delete_batch(
        &self,
        parent_id: EntryId,
        listing: &Listing,
        force: bool,
    ) -> Result<HashSet<EntryId>> {
        let mut tx = self.store.tx_start()?;

        let mut all_ids = Vec::with_capacity(listing.len() + 1);
        all_ids.push(parent_id);
        all_ids.extend(listing.values().map(|e| e.file_id));

        let infos = self.lock_ids(&mut tx, &all_ids)?;
        let mut reclaimed = HashSet::new();

        if let Some(parent) = infos.get(&parent_id) {
            let mut new_listing = parent.listing().cloned().ok_or_else(|| {
                Error::inconsistent(format!("delete parent {parent_id} is not a directory"))
            })?;

            for (name, child) in listing {
                // Only drop the name if it still refers to this child
                if new_listing.get(name).is_some_and(|e| e.file_id != child.file_id) {
                    continue;
                }

                match infos.get(&child.file_id) {
                    Some(info) => {
                        let reclaimable = if info.is_file() {
                            force || !info.is_locked()
                        } else {
                            info.is_empty_directory()
                        };
                        if reclaimable {
                            tx.remove(child.file_id)?;
                            new_listing.remove(name);
                            reclaimed.insert(child.file_id);
                        }
                    }
                    None => {
                        new_listing.remove(name);
                        reclaimed.insert(child.file_id);
                    }
                }
            }

            tx.put(parent.with_listing(new_listing))?;
        }

        tx.commit()?;
        Ok(reclaimed)
    }

    /// Remove the child `name` of `parent_id` unless it is a non-empty
    /// directory. Returns `true` when the entry was removed.
    pub fn delete_entry(&self, parent_id: EntryId, name: &str, id: EntryId) -> Result<bool> {
        let mut tx = self.store.tx_start()?;

        let infos = self.lock_ids(&mut tx, &[parent_id, id])?;
        let (Some(parent), Some(info)) = (infos.get(&parent_id), infos.get(&id)) else {
            return Ok(false);
        };

        if info.listing().is_some_and(|l| !l.is_empty()) {
            return Ok(false);
        }

        if let Some(listing_entry) = parent.listing_entry(name).filter(|e| e.file_id == id) {
            let update = EntryUpdate::RemoveListing {
                name: name.to_string(),
                entry: *listing_entry,
            };
            tx.transform(parent_id, |p| update.apply(p))?;
        }
        tx.remove(id)?;
        tx.commit()?;

        Ok(true)
    }

    // ---- Updates ----

    /// Merge `updates` into the properties of `id`; a `None` value removes
    /// the key. The parent listing entry is refreshed when a parent is
    /// given. Returns `None` when the entry does not exist.
    pub fn update_properties_in(
        &self,
        tx: &mut Tx<'_>,
        parent_id: Option<EntryId>,
        id: EntryId,
        name: &str,
        updates: &PropertyUpdates,
    ) -> Result<Option<Entry>> {
        debug_assert!(EntryStore::tx_active());

        let Some(info) = tx.get(id)? else {
            return Ok(None);
        };

        let mut props = info.properties().clone();
        for (key, value) in updates {
            match value {
                Some(value) => props.insert(key.clone(), value.clone()),
                None => props.remove(key),
            };
        }

        let updated = info.with_properties(props);
        tx.put(updated.clone())?;

        if let Some(parent_id) = parent_id {
            let update = EntryUpdate::ListingEntry {
                file_id: id,
                name: name.to_string(),
                length_delta: 0,
                access_time: None,
                modification_time: None,
            };
            tx.transform(parent_id, |p| update.apply(p))?;
        }

        Ok(Some(updated))
    }

    /// Standalone transaction around [`Self::update_properties_in`].
    pub fn update_properties(
        &self,
        parent_id: Option<EntryId>,
        id: EntryId,
        name: &str,
        updates: &PropertyUpdates,
    ) -> Result<Option<Entry>> {
        let mut tx = self.store.tx_start()?;

        match parent_id {
            Some(parent_id) => self.lock_ids(&mut tx, &[parent_id, id])?,
            None => self.lock_ids(&mut tx, &[id])?,
        };

        let updated = self.update_properties_in(&mut tx, parent_id, id, name, updates)?;
        tx.commit()?;
        Ok(updated)
    }

    /// Replace an entry with `f(current)` under lock.
    ///
    /// `f` must keep the ID and the file/directory kind. Returns `None`
    /// when the entry does not exist.
    pub fn update_info<F>(&self, id: EntryId, f: F) -> Result<Option<Entry>>
    where
        F: FnOnce(&Entry) -> Entry,
    {
        let mut tx = self.store.tx_start()?;

        let Some(current) = tx.get(id)? else {
            return Ok(None);
        };

        let updated = f(&current);
        if updated.id() != current.id() {
            return Err(Error::inconsistent(format!(
                "failed to update {id}: file IDs differ ({})",
                updated.id()
            )));
        }
        if updated.is_directory() != current.is_directory() {
            return Err(Error::inconsistent(format!(
                "failed to update {id}: file types differ"
            )));
        }

        if !tx.replace(&current, updated.clone())? {
            return Err(Error::ConcurrentModification);
        }
        tx.commit()?;
        Ok(Some(updated))
    }

    /// Shift the cached length of a child reference and set its
    /// modification time.
    pub fn update_parent_listing(
        &self,
        parent_id: EntryId,
        id: EntryId,
        name: &str,
        length_delta: i64,
        modification_time: i64,
    ) -> Result<()> {
        let update = EntryUpdate::ListingEntry {
            file_id: id,
            name: name.to_string(),
            length_delta,
            access_time: None,
            modification_time: Some(modification_time),
        };
        self.store.transform(parent_id, |p| update.apply(p))?;
        Ok(())
    }

    /// Set access and modification times; `-1` keeps the current value.
    pub fn update_times(
        &self,
        parent_id: EntryId,
        id: EntryId,
        name: &str,
        access_time: i64,
        modification_time: i64,
    ) -> Result<()> {
        let mut tx = self.store.tx_start()?;

        let infos = self.lock_ids(&mut tx, &[parent_id, id])?;
        let info = infos
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("failed to update times of {id}")))?;
        let parent = infos
            .get(&parent_id)
            .ok_or_else(|| Error::not_found(format!("failed to lock parent {parent_id}")))?;

        if !parent.listing_entry(name).is_some_and(|e| e.file_id == id) {
            return Err(Error::ConcurrentModification);
        }

        let atime = if access_time == -1 { info.access_time() } else { access_time };
        let mtime = if modification_time == -1 {
            info.modification_time()
        } else {
            modification_time
        };

        tx.put(info.with_times(atime, mtime))?;

        let update = EntryUpdate::ListingEntry {
            file_id: id,
            name: name.to_string(),
            length_delta: 0,
            access_time: Some(atime),
            modification_time: Some(mtime),
        };
        tx.transform(parent_id, |p| update.apply(p))?;

        tx.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn manager() -> MetaManager {
        MetaManager::new(
            EntryStore::in_memory(),
            &FsConfig::default(),
            EventBus::new(),
            Arc::new(LocalMetrics::default()),
        )
    }

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap()
    }

    fn dir() -> Entry {
        Entry::directory(Properties::new())
    }

    fn file() -> Entry {
        Entry::file(1024, 0, None, Properties::new())
    }

    /// Create `name` under `parent` and return its ID.
    fn add(meta: &MetaManager, parent: EntryId, name: &str, entry: Entry) -> EntryId {
        let id = entry.id();
        assert!(meta.put_if_absent(parent, name, entry).unwrap().is_none());
        id
    }

    #[test]
    fn test_root_created_lazily() {
        let meta = manager();
        assert!(meta.store().is_empty());

        let root = meta.info(EntryId::ROOT).unwrap().unwrap();
        assert!(root.is_empty_directory());
        assert_eq!(meta.store().len(), 1);
    }

    #[test]
    fn test_file_ids_stop_at_missing_component() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let b = add(&meta, a, "b", dir());

        assert_eq!(
            meta.file_ids(&p("/a/b")).unwrap(),
            vec![Some(EntryId::ROOT), Some(a), Some(b)]
        );
        assert_eq!(
            meta.file_ids(&p("/a/x/y")).unwrap(),
            vec![Some(EntryId::ROOT), Some(a), None, None]
        );
        assert_eq!(meta.file_ids(&FsPath::root()).unwrap(), vec![Some(EntryId::ROOT)]);
        assert_eq!(meta.file_id(&p("/a/b")).unwrap(), Some(b));
        assert_eq!(meta.file_id_in(a, "b").unwrap(), Some(b));
        assert_eq!(meta.file_id(&p("/zzz")).unwrap(), None);
    }

    #[test]
    fn test_put_if_absent_returns_existing() {
        let meta = manager();
        let first = dir();
        add(&meta, EntryId::ROOT, "a", first.clone());

        let existing = meta.put_if_absent(EntryId::ROOT, "a", dir()).unwrap();
        assert_eq!(existing.map(|e| e.id()), Some(first.id()));
        assert_eq!(meta.directory_listing(EntryId::ROOT).unwrap().len(), 1);
    }

    /// Directory `d` under the root with a file `f` whose ID sorts below it
    fn dir_with_lower_child(meta: &MetaManager) -> (EntryId, EntryId) {
        let d = add(meta, EntryId::ROOT, "d", dir());
        let f = std::iter::repeat_with(file)
            .find(|f| f.id() < d)
            .map(|f| add(meta, d, "f", f))
            .unwrap();
        (d, f)
    }

    #[test]
    fn test_put_if_absent_collision_keeps_lock_order() {
        let meta = manager();
        let (d, f) = dir_with_lower_child(&meta);

        let mut tx = meta.store().tx_start().unwrap();
        let existing = meta.put_if_absent_in(&mut tx, d, "f", file()).unwrap();
        assert_eq!(existing.map(|e| e.id()), Some(f));
        assert_eq!(tx.locked_ids(), &[d]);
    }

    #[test]
    fn test_put_if_absent_collision_with_sorted_locker() {
        let meta = Arc::new(manager());
        let (d, f) = dir_with_lower_child(&meta);

        for _ in 0..50 {
            let barrier = Arc::new(Barrier::new(2));
            let locker = {
                let meta = Arc::clone(&meta);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut tx = meta.store().tx_start().unwrap();
                    let infos = meta.lock_ids(&mut tx, &[d, f]).unwrap();
                    assert_eq!(infos.len(), 2);
                    tx.commit().unwrap();
                })
            };

            barrier.wait();
            let existing = meta.put_if_absent(d, "f", file()).unwrap();
            assert_eq!(existing.map(|e| e.id()), Some(f));
            locker.join().unwrap();
        }
    }

    #[test]
    fn test_put_if_absent_under_file_fails() {
        let meta = manager();
        let f = add(&meta, EntryId::ROOT, "f", file());
        let err = meta.put_if_absent(f, "x", file()).unwrap_err();
        assert!(matches!(err, Error::ParentNotDirectory(_)));
    }

    #[test]
    fn test_concurrent_creation_single_winner() {
        let meta = Arc::new(manager());
        meta.info(EntryId::ROOT).unwrap();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let meta = Arc::clone(&meta);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let entry = dir();
                    let id = entry.id();
                    barrier.wait();
                    let existing = meta.put_if_absent(EntryId::ROOT, "race", entry).unwrap();
                    (id, existing.map(|e| e.id()))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|(_, existing)| existing.is_none()).collect();
        assert_eq!(winners.len(), 1);

        let winner = winners[0].0;
        for (_, existing) in &results {
            if let Some(existing) = existing {
                assert_eq!(*existing, winner);
            }
        }
        assert_eq!(meta.file_id(&p("/race")).unwrap(), Some(winner));
        // Losers never reached the store
        assert_eq!(meta.store().len(), 2);
    }

    #[test]
    fn test_lock_ids_sorted_and_root_forced() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let b = add(&meta, EntryId::ROOT, "b", dir());
        let missing = EntryId::random();

        let mut tx = meta.store().tx_start().unwrap();
        let infos = meta
            .lock_ids(&mut tx, &[b, missing, EntryId::ROOT, a, b])
            .unwrap();

        let mut expected = vec![EntryId::ROOT, a, b, missing];
        expected.sort_unstable();
        assert_eq!(tx.locked_ids(), expected.as_slice());
        assert_eq!(infos.len(), 3);
        assert!(!infos.contains_key(&missing));
    }

    #[test]
    fn test_move_self_is_noop() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let before = meta.info(EntryId::ROOT).unwrap();

        meta.move_entry(a, "a", EntryId::ROOT, "a", EntryId::ROOT).unwrap();
        assert_eq!(meta.info(EntryId::ROOT).unwrap(), before);
    }

    #[test]
    fn test_move_between_directories() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let b = add(&meta, EntryId::ROOT, "b", dir());
        let f = add(&meta, a, "f", file());

        meta.move_entry(f, "f", a, "g", b).unwrap();
        assert_eq!(meta.file_id(&p("/a/f")).unwrap(), None);
        assert_eq!(meta.file_id(&p("/b/g")).unwrap(), Some(f));
    }

    #[test]
    fn test_move_rejects_existing_destination() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let f = add(&meta, a, "f", file());
        add(&meta, a, "g", file());

        let err = meta.move_entry(f, "f", a, "g", a).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(meta.file_id(&p("/a/f")).unwrap(), Some(f));
    }

    #[test]
    fn test_move_detects_stale_source() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let f = add(&meta, a, "f", file());
        let other = add(&meta, a, "other", file());

        let err = meta.move_entry(other, "f", a, "x", a).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(meta.file_id(&p("/a/f")).unwrap(), Some(f));
    }

    #[test]
    fn test_opposite_movers_do_not_deadlock() {
        let meta = Arc::new(manager());
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let b = add(&meta, EntryId::ROOT, "b", dir());
        let fa = add(&meta, a, "fa", file());
        let fb = add(&meta, b, "fb", file());

        let mover = |meta: Arc<MetaManager>, id: EntryId, name: &'static str, x: EntryId, y: EntryId| {
            thread::spawn(move || {
                for _ in 0..200 {
                    meta.move_entry(id, name, x, name, y).unwrap();
                    meta.move_entry(id, name, y, name, x).unwrap();
                }
            })
        };

        let h1 = mover(Arc::clone(&meta), fa, "fa", a, b);
        let h2 = mover(Arc::clone(&meta), fb, "fb", b, a);
        h1.join().unwrap();
        h2.join().unwrap();

        assert_eq!(meta.file_id(&p("/a/fa")).unwrap(), Some(fa));
        assert_eq!(meta.file_id(&p("/b/fb")).unwrap(), Some(fb));
    }

    #[test]
    fn test_soft_delete_moves_to_trash() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let f = add(&meta, a, "f", file().with_length(42));

        let trashed = meta.soft_delete(Some(EntryId::ROOT), Some("a"), a).unwrap();
        assert_eq!(trashed, Some(a));
        assert_eq!(meta.file_id(&p("/a")).unwrap(), None);
        assert_eq!(meta.pending_deletes().unwrap(), vec![a]);
        assert_eq!(meta.file_id_in(EntryId::TRASH, &a.to_string()).unwrap(), Some(a));

        // Content stays intact until reclaimed
        assert_eq!(meta.file_id_in(a, "f").unwrap(), Some(f));
        assert_eq!(meta.info(f).unwrap().unwrap().length(), 42);
        assert!(meta.take_delete_signal());
    }

    #[test]
    fn test_soft_delete_root() {
        let meta = manager();
        add(&meta, EntryId::ROOT, "a", dir());
        add(&meta, EntryId::ROOT, "b", file());

        let holder = meta.soft_delete(None, None, EntryId::ROOT).unwrap().unwrap();
        assert!(meta.directory_listing(EntryId::ROOT).unwrap().is_empty());
        assert_eq!(meta.pending_deletes().unwrap(), vec![holder]);

        let moved = meta.directory_listing(holder).unwrap();
        assert_eq!(moved.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        assert_eq!(meta.soft_delete(None, None, EntryId::ROOT).unwrap(), None);
        assert!(meta.info(EntryId::TRASH).unwrap().is_some());
    }

    #[test]
    fn test_remove_if_empty() {
        let meta = manager();
        let a = add(&meta, EntryId::ROOT, "a", dir());
        let f = add(&meta, a, "f", file());

        let err = meta
            .remove_if_empty(EntryId::ROOT, "a", a, &p("/a"), false)
            .unwrap_err();
        assert!(matches!(err, Error::DirectoryNotEmpty(_)));

        meta.lock(f).unwrap();
        let err = meta.remove_if_empty(a, "f", f, &p("/a/f"), false).unwrap_err();
        assert!(matches!(err, Error::FileLocked(_)));

        let removed = meta.remove_if_empty(a, "f", f, &p("/a/f"), true).unwrap().unwrap();
        assert_eq!(removed.path(), Some(&p("/a/f")));
        assert_eq!(meta.pending_deletes().unwrap(), vec![f]);

        assert!(meta.remove_if_empty(a, "f", f, &p("/a/f"), true).unwrap().is_none());
    }

    #[test]
    fn test_delete_batch_respects_emptiness() {
        let meta = manager();
        let d = add(&meta, EntryId::ROOT, "d", dir());
        let full = add(&meta, d, "full", dir());
        add(&meta, full, "inner", file());
        let empty = add(&meta, d, "empty", dir());
        let f = add(&meta, d, "f", file());
        let locked = add(&meta, d, "locked", file());
        meta.lock(locked).unwrap();

        let listing = meta.directory_listing(d).unwrap();
        let reclaimed = meta.delete_batch(d, &listing, false).unwrap();

        assert_eq!(reclaimed, HashSet::from([empty, f]));
        let left = meta.directory_listing(d).unwrap();
        assert_eq!(left.keys().collect::<Vec<_>>(), vec!["full", "locked"]);
        assert!(meta.info(full).unwrap().is_some());
        assert!(meta.info(f).unwrap().is_none());

        let reclaimed = meta.delete_batch(d, &left, true).unwrap();
        assert_eq!(reclaimed, HashSet::from([locked]));
    }

    #[test]
    fn test_delete_entry() {
        let meta = manager();
        let d = add(&meta, EntryId::ROOT, "d", dir());
        add(&meta, d, "f", file());

        assert!(!meta.delete_entry(EntryId::ROOT, "d", d).unwrap());
        let listing = meta.directory_listing(d).unwrap();
        meta.delete_batch(d, &listing, false).unwrap();
        assert!(meta.delete_entry(EntryId::ROOT, "d", d).unwrap());
        assert!(!meta.exists(d));
        assert!(!meta.delete_entry(EntryId::ROOT, "d", d).unwrap());
    }

    #[test]
    fn test_writer_lock_cycle() {
        let meta = manager();
        let f = add(&meta, EntryId::ROOT, "f", file());

        let locked = meta.lock(f).unwrap();
        assert!(locked.is_locked());
        assert!(matches!(meta.lock(f), Err(Error::FileLocked(_))));

        let unlocked = meta.unlock(&locked, 1234).unwrap();
        assert!(!unlocked.is_locked());
        assert_eq!(unlocked.modification_time(), 1234);

        assert!(meta.unlock(&locked, 1).is_err());
        assert!(meta.lock(EntryId::random()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_properties() {
        let meta = manager();
        let mut props = Properties::new();
        props.insert("usrName".into(), "alice".into());
        props.insert("grpName".into(), "staff".into());
        let f = add(&meta, EntryId::ROOT, "f", Entry::file(1024, 0, None, props));

        let mut updates = PropertyUpdates::new();
        updates.insert("usrName".into(), Some("bob".into()));
        updates.insert("grpName".into(), None);

        let updated = meta
            .update_properties(Some(EntryId::ROOT), f, "f", &updates)
            .unwrap()
            .unwrap();
        assert_eq!(updated.property("usrName"), Some("bob"));
        assert_eq!(updated.property("grpName"), None);
        assert!(meta
            .update_properties(None, EntryId::random(), "x", &updates)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_info_validates() {
        let meta = manager();
        let f = add(&meta, EntryId::ROOT, "f", file());

        let updated = meta.update_info(f, |e| e.with_length(10)).unwrap().unwrap();
        assert_eq!(updated.length(), 10);
        assert!(meta.update_info(f, |_| file()).is_err());
        assert!(meta.update_info(EntryId::random(), |e| e.clone()).unwrap().is_none());
    }

    #[test]
    fn test_update_times_and_listing() {
        let meta = manager();
        let f = add(&meta, EntryId::ROOT, "f", file());

        meta.update_times(EntryId::ROOT, f, "f", 100, -1).unwrap();
        let info = meta.info(f).unwrap().unwrap();
        assert_eq!(info.access_time(), 100);

        meta.update_parent_listing(EntryId::ROOT, f, "f", 64, 200).unwrap();
        let listed = *meta.info(EntryId::ROOT).unwrap().unwrap().listing_entry("f").unwrap();
        assert_eq!(listed.access_time, 100);
        assert_eq!(listed.length, 64);
        assert_eq!(listed.modification_time, 200);

        let err = meta.update_times(EntryId::ROOT, f, "other", 1, 1).unwrap_err();
        assert!(err.is_retryable());
    }
}
