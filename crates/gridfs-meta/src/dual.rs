//! DUAL mode synchronization
//!
//! In DUAL modes the secondary file system is authoritative and the local
//! namespace caches it. Every operation first resolves its paths locally,
//! locks the deepest existing ancestors, re-creates missing components from
//! the secondary file system and then runs its task in the same
//! transaction. Secondary calls happen while the locks are held.

use crate::events::{FsEvent, FsEventKind};
use crate::manager::MetaManager;
use crate::metrics::LocalMetrics;
use crate::secondary::{FileStatus, SecondaryAttributes, SecondaryFs, parse_permission};
use crate::update::EntryUpdate;
use gridfs_common::{
    Entry, EntryId, Error, FsPath, ListingEntry, PROP_PERMISSION, Properties, PropertyUpdates,
    Result,
};
use gridfs_meta_store::Tx;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io::{Read, Write};
use std::thread;
use tracing::{debug, error};

/// Local entries of the paths taking part in a synchronized operation
pub type PathInfos = HashMap<FsPath, Entry>;

/// Output stream opened on the secondary file system
pub struct SecondaryOutput {
    pub parent_id: EntryId,
    /// Local entry, holding the writer lock
    pub info: Entry,
    pub out: Box<dyn Write + Send>,
    /// Local file replaced by an overwriting create
    pub replaced: Option<Entry>,
}

/// Input stream opened on the secondary file system
pub struct SecondaryInput {
    pub info: Entry,
    pub input: Box<dyn Read + Send>,
}

impl fmt::Debug for SecondaryOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryOutput")
            .field("parent_id", &self.parent_id)
            .field("info", &self.info)
            .field("replaced", &self.replaced)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for SecondaryInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryInput")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

fn secondary_status(fs: &dyn SecondaryFs, path: &FsPath) -> Result<Option<FileStatus>> {
    fs.status(path)
        .map_err(|e| Error::secondary(format!("failed to get status of {path}"), e))
}

/// Ancestor of `path` at `depth`
fn ancestor(path: &FsPath, depth: usize) -> FsPath {
    let mut cur = path.clone();
    while cur.depth() > depth {
        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }
    cur
}

/// Deepest path of `infos` with its entry
fn deepest(infos: &PathInfos) -> Result<(FsPath, Entry)> {
    infos
        .iter()
        .max_by_key(|(path, _)| path.depth())
        .map(|(path, info)| (path.clone(), info.clone()))
        .ok_or_else(|| Error::inconsistent("no existing parent was resolved"))
}

/// `DirCreated` events for the directories below `from` down to `to`,
/// top-down
fn dir_created_events(from: &FsPath, to: &FsPath) -> Vec<FsEvent> {
    let mut events = Vec::new();
    let mut cur = to.clone();

    while cur != *from && cur.depth() > from.depth() {
        events.push(FsEvent::new(FsEventKind::DirCreated, cur.clone()));
        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }

    events.reverse();
    events
}

impl MetaManager {
    /// Re-create the components of `end_path` below `start_path` from the
    /// secondary file system.
    ///
    /// Returns the entry of `end_path`. A component missing remotely fails
    /// in strict mode; otherwise the deepest synchronized entry is recorded
    /// in `created` under its path and `None` is returned.
    pub(crate) fn synchronize(
        &self,
        tx: &mut Tx<'_>,
        fs: &dyn SecondaryFs,
        start_path: &FsPath,
        start_info: &Entry,
        end_path: &FsPath,
        strict: bool,
        mut created: Option<&mut BTreeMap<FsPath, Entry>>,
    ) -> Result<Option<Entry>> {
        let mut parent_info = start_info.clone();
        let mut cur_path = start_path.clone();

        for name in end_path.components().into_iter().skip(start_path.depth()) {
            cur_path = cur_path.child(name)?;

            if let Some(existing) = created.as_deref().and_then(|c| c.get(&cur_path)) {
                parent_info = existing.clone();
                continue;
            }

            let status = match fs.status(&cur_path) {
                Ok(status) => status,
                Err(e) if strict => {
                    return Err(Error::secondary(
                        format!("failed to create path locally: {cur_path}"),
                        e,
                    ));
                }
                Err(e) => {
                    debug!("Failed to get secondary status of {}: {}", cur_path, e);
                    None
                }
            };

            let Some(status) = status else {
                if strict {
                    return Err(Error::secondary_msg(format!(
                        "failed to create path locally (not found in the secondary file system): {cur_path}"
                    )));
                }
                if let (Some(created), Some(parent_path)) = (created.as_deref_mut(), cur_path.parent())
                {
                    created.insert(parent_path, parent_info);
                }
                return Ok(None);
            };

            if !status.is_dir && cur_path != *end_path {
                return Err(Error::ParentNotDirectory(format!(
                    "secondary file system structure was modified concurrently, not a directory: {cur_path}"
                )));
            }

            let entry = if status.is_dir {
                Entry::directory(status.properties())
            } else {
                Entry::file(self.block_size, status.len, None, status.properties())
            };
            let entry = entry.with_times(status.access_time, status.modification_time);

            let cur_info = self
                .put_if_absent_in(tx, parent_info.id(), name, entry.clone())?
                .unwrap_or(entry);

            if let Some(created) = created.as_deref_mut() {
                created.insert(cur_path.clone(), cur_info.clone());
            }
            parent_info = cur_info;
        }

        Ok(Some(parent_info))
    }

    /// Lock the deepest existing ancestors of `paths` and synchronize the
    /// missing parts. `None` means the local namespace changed before the
    /// locks were taken and the caller should start over.
    fn lock_paths(
        &self,
        fs: &dyn SecondaryFs,
        strict: bool,
        extra_lock_ids: &[EntryId],
        paths: &[FsPath],
    ) -> Result<Option<(Tx<'_>, PathInfos)>> {
        let path_ids = paths
            .iter()
            .map(|path| self.file_ids(path))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.store.tx_start()?;

        let mut path_to_parent: HashMap<FsPath, FsPath> = HashMap::new();
        let mut path_to_id: HashMap<FsPath, EntryId> = HashMap::new();

        for (path, ids) in paths.iter().zip(&path_ids) {
            if ids.len() > 1 {
                // The first element is always the root
                let (depth, parent_id) = ids[..ids.len() - 1]
                    .iter()
                    .enumerate()
                    .rev()
                    .find_map(|(depth, id)| id.map(|id| (depth, id)))
                    .ok_or_else(|| Error::inconsistent(format!("no parent resolved for {path}")))?;

                let parent_path = ancestor(path, depth);
                path_to_id.insert(parent_path.clone(), parent_id);
                path_to_parent.insert(path.clone(), parent_path);
            }

            if let Some(Some(id)) = ids.last() {
                path_to_id.insert(path.clone(), *id);
            }
        }

        let mut lock: Vec<EntryId> = path_to_id.values().copied().collect();
        lock.extend_from_slice(extra_lock_ids);

        let mut id_to_info = self.lock_ids(&mut tx, &lock)?;
        for id in extra_lock_ids {
            id_to_info.remove(id);
        }

        // Locked IDs must still sit at the expected paths
        let expected: HashSet<EntryId> = path_to_id.values().copied().collect();
        if id_to_info.len() != expected.len() {
            return Err(Error::ConcurrentModification);
        }
        for (path, id) in &path_to_id {
            if self.file_id(path)? != Some(*id) {
                return Err(Error::ConcurrentModification);
            }
        }

        for (path, ids) in paths.iter().zip(&path_ids) {
            if self.file_ids(path)? != *ids {
                debug!("New parents appeared for {}, restarting", path);
                return Ok(None);
            }
        }

        let info_of = |id: &EntryId| {
            id_to_info
                .get(id)
                .cloned()
                .ok_or_else(|| Error::inconsistent(format!("locked entry {id} is missing")))
        };

        let mut infos = PathInfos::new();
        let mut created = BTreeMap::new();

        for path in paths {
            let parent_path = path.parent();

            if let Some(id) = path_to_id.get(path) {
                infos.insert(path.clone(), info_of(id)?);

                if let Some(parent_path) = parent_path {
                    let parent_id = path_to_id.get(&parent_path).ok_or_else(|| {
                        Error::inconsistent(format!("parent of {path} was not locked"))
                    })?;
                    infos.insert(parent_path, info_of(parent_id)?);
                }
                continue;
            }

            let first_parent = path_to_parent
                .get(path)
                .ok_or_else(|| Error::inconsistent(format!("no parent resolved for {path}")))?;
            let first_info = path_to_id
                .get(first_parent)
                .ok_or_else(|| Error::inconsistent(format!("parent of {path} was not locked")))
                .and_then(&info_of)?;

            let info = self.synchronize(
                &mut tx,
                fs,
                first_parent,
                &first_info,
                path,
                strict,
                Some(&mut created),
            )?;
            if let Some(info) = info {
                infos.insert(path.clone(), info);
            }

            if let Some(parent_path) = parent_path {
                if parent_path == *first_parent {
                    infos.insert(parent_path, first_info);
                } else if let Some(parent_info) = created.get(&parent_path) {
                    infos.insert(parent_path, parent_info.clone());
                } else if let Some((last_path, last_info)) = created.last_key_value() {
                    // Deepest ancestor that exists in the secondary file system
                    infos.insert(last_path.clone(), last_info.clone());
                }
            }
        }

        Ok(Some((tx, infos)))
    }

    /// Synchronize `paths` with the secondary file system and run `task`
    /// in the locking transaction.
    ///
    /// The transaction commits only when `task` succeeds. A concurrent
    /// change of the local namespace restarts the whole procedure, with a
    /// bounded backoff after repeated restarts.
    pub(crate) fn synchronize_and_execute<T, F>(
        &self,
        op: &str,
        fs: &dyn SecondaryFs,
        strict: bool,
        extra_lock_ids: &[EntryId],
        paths: &[&FsPath],
        task: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Tx<'_>, &PathInfos) -> Result<T>,
    {
        let mut sorted: Vec<FsPath> = paths.iter().map(|p| (*p).clone()).collect();
        sorted.sort();

        let failed = |err: Error| {
            error!("{} in DUAL mode failed {:?}: {}", op, sorted, err);
            err
        };

        let mut attempt: u32 = 0;
        let (mut tx, infos) = loop {
            attempt += 1;

            match self.lock_paths(fs, strict, extra_lock_ids, &sorted) {
                Ok(Some(locked)) => break locked,
                Ok(None) => {}
                Err(Error::ConcurrentModification) => {
                    LocalMetrics::incr(&self.metrics.sync_restarts);
                    if let Some(delay) = self.sync.backoff(attempt) {
                        debug!("{} restart {} for {:?}, backing off {:?}", op, attempt, sorted, delay);
                        thread::sleep(delay);
                    }
                }
                Err(e) => return Err(failed(e)),
            }
        };

        let res = task(&mut tx, &infos).map_err(&failed)?;
        tx.commit().map_err(&failed)?;
        Ok(res)
    }

    // ---- DUAL operations ----

    /// Create a file in the secondary file system and mirror it locally.
    ///
    /// The new local entry holds the writer lock. An existing local file is
    /// replaced and returned in [`SecondaryOutput::replaced`] so its data
    /// can be purged.
    pub fn create_dual(
        &self,
        fs: &dyn SecondaryFs,
        path: &FsPath,
        overwrite: bool,
        permission: Option<u32>,
        affinity_key: Option<EntryId>,
    ) -> Result<SecondaryOutput> {
        let parent_path = path
            .parent()
            .ok_or_else(|| Error::invalid_path("failed to create the root directory as a file"))?;

        let mut pending = Vec::new();

        // The file is locked along with its parent in case it gets replaced
        let res = self.synchronize_and_execute("File create", fs, false, &[], &[&parent_path, path], |tx, infos| {
            let ancestors: PathInfos = infos
                .iter()
                .filter(|(p, _)| *p != path)
                .map(|(p, info)| (p.clone(), info.clone()))
                .collect();
            let (deepest_path, mut parent_info) = deepest(&ancestors)?;

            let out = fs
                .create(path, overwrite)
                .map_err(|e| Error::secondary(format!("failed to create {path}"), e))?;
            if let Some(permission) = permission {
                fs.set_permission(path, permission).map_err(|e| {
                    Error::secondary(format!("failed to set permission of {path}"), e)
                })?;
            }

            if deepest_path != parent_path {
                parent_info = self
                    .synchronize(tx, fs, &deepest_path, &parent_info, &parent_path, true, None)?
                    .ok_or_else(|| Error::inconsistent(format!("failed to synchronize {parent_path}")))?;
                pending.extend(dir_created_events(&deepest_path, &parent_path));
            }

            let status = secondary_status(fs, path)?.ok_or_else(|| {
                Error::secondary_msg(format!(
                    "file created in the secondary file system no longer exists: {path}"
                ))
            })?;
            if status.is_dir {
                return Err(Error::secondary_msg(format!(
                    "file created in the secondary file system is a directory: {path}"
                )));
            }

            let block_size = u32::try_from(status.block_size)
                .ok()
                .filter(|b| *b > 0)
                .unwrap_or(self.block_size);
            let new_info = Self::lock_info(
                &Entry::file(block_size, status.len, affinity_key, status.properties())
                    .with_times(status.access_time, status.modification_time),
            )?;

            let replaced = match self.put_if_absent_in(tx, parent_info.id(), path.name(), new_info.clone())? {
                None => None,
                Some(old) if old.is_directory() => {
                    return Err(Error::already_exists(format!(
                        "failed to create file (path points to a directory): {path}"
                    )));
                }
                Some(old) => {
                    tx.remove(old.id())?;
                    tx.put(new_info.clone())?;

                    let remove = EntryUpdate::RemoveListing {
                        name: path.name().to_string(),
                        entry: ListingEntry::from(&old),
                    };
                    tx.transform(parent_info.id(), |p| remove.apply(p))?;

                    let add = EntryUpdate::AddListing {
                        name: path.name().to_string(),
                        entry: ListingEntry::from(&new_info),
                    };
                    tx.transform(parent_info.id(), |p| add.apply(p))?;

                    pending.push(FsEvent::new(FsEventKind::FileDeleted, path.clone()));
                    Some(old)
                }
            };

            pending.push(FsEvent::new(FsEventKind::FileCreated, path.clone()));

            Ok(SecondaryOutput {
                parent_id: parent_info.id(),
                info: new_info,
                out,
                replaced,
            })
        });

        if res.is_ok() {
            self.events.record_all(pending);
        }
        res
    }

    /// Open an existing secondary file for append and lock its local entry.
    pub fn append_dual(&self, fs: &dyn SecondaryFs, path: &FsPath) -> Result<SecondaryOutput> {
        self.synchronize_and_execute("File append", fs, true, &[], &[path], |tx, infos| {
            let info = infos
                .get(path)
                .ok_or_else(|| Error::not_found(format!("file not found: {path}")))?;
            if info.is_directory() {
                return Err(Error::invalid_path(format!(
                    "failed to open output stream (path points to a directory): {path}"
                )));
            }

            let parent_id = path
                .parent()
                .and_then(|p| infos.get(&p))
                .map(Entry::id)
                .ok_or_else(|| Error::inconsistent(format!("parent of {path} was not resolved")))?;

            let out = fs
                .append(path)
                .map_err(|e| Error::secondary(format!("failed to append to {path}"), e))?;

            let info = Self::lock_info(info)?;
            tx.put(info.clone())?;

            Ok(SecondaryOutput {
                parent_id,
                info,
                out,
                replaced: None,
            })
        })
    }

    /// Open a secondary file for reading, synchronizing its entry first
    /// when it is not known locally.
    pub fn open_dual(&self, fs: &dyn SecondaryFs, path: &FsPath) -> Result<SecondaryInput> {
        let open = |info: Entry| {
            if !info.is_file() {
                return Err(Error::invalid_path(format!(
                    "failed to open file (not a file): {path}"
                )));
            }
            let input = fs
                .open(path)
                .map_err(|e| Error::secondary(format!("failed to open {path}"), e))?;
            Ok(SecondaryInput { info, input })
        };

        if let Some(info) = self.info_at(path)? {
            return open(info);
        }

        self.synchronize_and_execute("File open", fs, false, &[], &[path], |_, infos| {
            let info = infos
                .get(path)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("file not found: {path}")))?;
            open(info)
        })
    }

    /// Local entry of `path`, synchronized from the secondary file system
    /// when missing.
    pub fn synchronize_file_dual(&self, fs: &dyn SecondaryFs, path: &FsPath) -> Result<Option<Entry>> {
        if let Some(info) = self.info_at(path)? {
            return Ok(Some(info));
        }

        self.synchronize_and_execute("Path synchronization", fs, false, &[], &[path], |_, infos| {
            Ok(infos.get(path).cloned())
        })
    }

    /// Create directories in the secondary file system and mirror them.
    pub fn mkdirs_dual(&self, fs: &dyn SecondaryFs, path: &FsPath, props: &Properties) -> Result<bool> {
        let Some(parent_path) = path.parent() else {
            return Ok(true);
        };

        let mut pending = Vec::new();

        let res = self.synchronize_and_execute("Directory creation", fs, false, &[], &[&parent_path], |tx, infos| {
            let permission = props.get(PROP_PERMISSION).and_then(|p| parse_permission(p));
            let created = fs
                .mkdirs(path, permission)
                .map_err(|e| Error::secondary(format!("failed to create directory {path}"), e))?;
            if !created {
                return Ok(false);
            }

            let (deepest_path, deepest_info) = deepest(infos)?;
            self.synchronize(tx, fs, &deepest_path, &deepest_info, path, true, None)?;

            pending.extend(dir_created_events(&deepest_path, path));
            Ok(true)
        });

        if res.is_ok() {
            self.events.record_all(pending);
        }
        res
    }

    /// Rename in the secondary file system, then move the local entry.
    ///
    /// When `dest` is an existing directory `src` is moved into it.
    pub fn rename_dual(&self, fs: &dyn SecondaryFs, src: &FsPath, dest: &FsPath) -> Result<bool> {
        let Some(src_parent) = src.parent() else {
            return Ok(false);
        };
        if dest.starts_with(src) {
            return Err(Error::invalid_path(format!(
                "failed to rename {src} into its own subtree: {dest}"
            )));
        }

        let mut pending = Vec::new();

        let res = self.synchronize_and_execute("Path rename", fs, false, &[], &[src, dest], |tx, infos| {
            let src_info = infos
                .get(src)
                .ok_or_else(|| Error::not_found(format!("failed to rename (source path not found): {src}")))?;
            let src_parent_info = infos
                .get(&src_parent)
                .ok_or_else(|| Error::inconsistent(format!("parent of {src} was not resolved")))?;
            let dest_info = infos.get(dest);
            let Some(dest_parent) = dest_info.or_else(|| dest.parent().and_then(|p| infos.get(&p)))
            else {
                return Err(Error::not_found(format!(
                    "failed to rename (destination path not found): {dest}"
                )));
            };

            if dest_info.is_some_and(Entry::is_file) {
                return Err(Error::already_exists(format!(
                    "failed to rename (destination path is an existing file): {dest}"
                )));
            }

            let renamed = fs
                .rename(src, dest)
                .map_err(|e| Error::secondary(format!("failed to rename {src} to {dest}"), e))?;
            if !renamed {
                return Err(Error::secondary_msg(format!(
                    "failed to rename (secondary file system returned false) [src={src}, dest={dest}]"
                )));
            }

            // Into an existing directory, otherwise under the new name
            let (dest_parent_id, dest_name, new_path) = match dest_info {
                Some(dest_dir) => (dest_dir.id(), src.name(), dest.child(src.name())?),
                None => (dest_parent.id(), dest.name(), dest.clone()),
            };
            self.move_in(tx, src_info.id(), src.name(), src_parent_info.id(), dest_name, dest_parent_id)?;

            let kind = if src_info.is_file() {
                FsEventKind::FileRenamed
            } else {
                FsEventKind::DirRenamed
            };
            pending.push(FsEvent::renamed(kind, src.clone(), new_path));
            Ok(true)
        });

        if res.is_ok() {
            self.events.record_all(pending);
        }
        res
    }

    /// Delete in the secondary file system, then move the local entry into
    /// trash. Returns `false` when the path does not exist or the secondary
    /// file system refused.
    pub fn delete_dual(&self, fs: &dyn SecondaryFs, path: &FsPath, recursive: bool) -> Result<bool> {
        let res = self.synchronize_and_execute("Path delete", fs, false, &[EntryId::TRASH], &[path], |tx, infos| {
            let Some(info) = infos.get(path) else {
                return Ok(false);
            };

            let deleted = fs
                .delete(path, recursive)
                .map_err(|e| Error::secondary(format!("failed to delete {path}"), e))?;
            if !deleted {
                return Ok(false);
            }

            match path.parent() {
                Some(parent_path) => {
                    let parent = infos.get(&parent_path).ok_or_else(|| {
                        Error::inconsistent(format!("parent of {path} was not resolved"))
                    })?;
                    self.soft_delete_in(tx, Some(parent.id()), Some(path.name()), info.id())?;

                    let update = EntryUpdate::Path(path.clone());
                    tx.transform(info.id(), |e| update.apply(e))?;
                }
                None => {
                    self.soft_delete_in(tx, None, None, EntryId::ROOT)?;
                }
            }

            Ok(true)
        })?;

        self.signal_delete_worker();
        Ok(res)
    }

    /// Apply ownership and permission changes in the secondary file system
    /// and merge `props` into the local entry.
    pub fn update_dual(
        &self,
        fs: &dyn SecondaryFs,
        path: &FsPath,
        props: &PropertyUpdates,
    ) -> Result<Option<Entry>> {
        if props.is_empty() {
            return Err(Error::invalid_argument("no properties to update"));
        }

        self.synchronize_and_execute("Path update", fs, false, &[], &[path], |tx, infos| {
            let Some(info) = infos.get(path) else {
                return Ok(None);
            };

            let attrs = SecondaryAttributes::from_updates(props);
            if attrs.user.is_some() || attrs.group.is_some() {
                fs.set_owner(path, attrs.user, attrs.group)
                    .map_err(|e| Error::secondary(format!("failed to set owner of {path}"), e))?;
            }
            if let Some(permission) = attrs.permission {
                fs.set_permission(path, permission)
                    .map_err(|e| Error::secondary(format!("failed to set permission of {path}"), e))?;
            }

            let parent_id = path.parent().and_then(|p| infos.get(&p)).map(Entry::id);
            self.update_properties_in(tx, parent_id, info.id(), path.name(), props)
        })
    }
}
