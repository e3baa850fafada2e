//! File system facade
//!
//! `GridFs` resolves the mode of every path once per call and dispatches to
//! the local-only (PRIMARY) or the synchronized (DUAL) operations of the
//! metadata manager. PROXY paths are rejected.

use crate::data::{BlockLocation, DataManager};
use crate::delete_worker::{DeleteTracker, DeleteWorker};
use crate::dual::{SecondaryInput, SecondaryOutput};
use crate::events::{EventBus, FsEvent, FsEventKind};
use crate::manager::MetaManager;
use crate::metrics::{LocalMetrics, MetricsSnapshot};
use crate::mode::ModeResolver;
use crate::secondary::{FileStatus, SecondaryFs, parse_permission};
use crate::stream::{FileReader, FileWriter};
use futures::future::{self, BoxFuture};
use futures::{FutureExt, TryFutureExt};
use gridfs_common::config::FsConfig;
use gridfs_common::{
    DEFAULT_DIR_PERMISSION, Entry, EntryId, Error, FsMode, FsPath, PROP_PERMISSION, Properties,
    PropertyUpdates, Result,
};
use gridfs_meta_store::EntryStore;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Public view of a file or directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FsFile {
    pub path: FsPath,
    /// Local entry ID, `None` for paths only known to the secondary file system
    pub file_id: Option<EntryId>,
    pub is_directory: bool,
    pub length: u64,
    pub block_size: u32,
    pub access_time: i64,
    pub modification_time: i64,
    pub properties: Properties,
}

impl FsFile {
    fn from_entry(path: FsPath, info: &Entry) -> Self {
        Self {
            path,
            file_id: Some(info.id()),
            is_directory: info.is_directory(),
            length: info.length(),
            block_size: info.block_size(),
            access_time: info.access_time(),
            modification_time: info.modification_time(),
            properties: info.properties().clone(),
        }
    }

    fn from_status(status: &FileStatus, block_size: u32) -> Self {
        Self {
            path: status.path.clone(),
            file_id: None,
            is_directory: status.is_dir,
            length: status.len,
            block_size: if status.is_dir { 0 } else { block_size },
            access_time: status.access_time,
            modification_time: status.modification_time,
            properties: status.properties(),
        }
    }

    #[must_use]
    pub const fn is_file(&self) -> bool {
        !self.is_directory
    }
}

/// Totals over a subtree
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PathSummary {
    pub files_count: u64,
    /// Directories below the path, the root itself is never counted
    pub directories_count: u64,
    pub total_length: u64,
}

fn default_dir_props() -> Properties {
    Properties::from([(PROP_PERMISSION.to_string(), DEFAULT_DIR_PERMISSION.to_string())])
}

fn cancelled() -> Error {
    Error::Cancelled("file system stopped before the purge completed".to_string())
}

/// Transactional namespace over an entry store
pub struct GridFs {
    name: String,
    block_size: u32,
    meta: Arc<MetaManager>,
    modes: ModeResolver,
    secondary: Option<Arc<dyn SecondaryFs>>,
    data: Arc<dyn DataManager>,
    metrics: Arc<LocalMetrics>,
    tracker: Arc<DeleteTracker>,
    worker: DeleteWorker,
}

impl GridFs {
    /// Start a file system over `store`.
    pub fn new(
        config: FsConfig,
        store: EntryStore,
        secondary: Option<Arc<dyn SecondaryFs>>,
        data: Arc<dyn DataManager>,
    ) -> Result<Self> {
        config.validate()?;

        let rules = config.mode_rules()?;
        let needs_secondary =
            config.default_mode.is_dual() || rules.iter().any(|(_, mode)| mode.is_dual());
        if needs_secondary && secondary.is_none() {
            return Err(Error::invalid_argument(
                "DUAL modes are configured but no secondary file system is given",
            ));
        }

        let rules_count = rules.len();
        let modes = ModeResolver::new(config.default_mode, rules);
        let metrics = Arc::new(LocalMetrics::default());
        let meta = Arc::new(MetaManager::new(
            store,
            &config,
            EventBus::new(),
            Arc::clone(&metrics),
        ));
        let tracker = Arc::new(DeleteTracker::default());
        let worker = DeleteWorker::start(
            Arc::clone(&meta),
            Arc::clone(&data),
            Arc::clone(&tracker),
            &config.delete_worker,
        )?;

        info!(
            "GridFS '{}' started (default mode {:?}, {} path rules)",
            config.name, config.default_mode, rules_count
        );

        Ok(Self {
            name: config.name,
            block_size: config.block_size,
            meta,
            modes,
            secondary,
            data,
            metrics,
            tracker,
            worker,
        })
    }

    /// Start a file system over a store opened from `config.store`.
    pub fn open_store(
        config: FsConfig,
        secondary: Option<Arc<dyn SecondaryFs>>,
        data: Arc<dyn DataManager>,
    ) -> Result<Self> {
        let store = EntryStore::open(&config.store)?;
        Self::new(config, store, secondary, data)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn meta(&self) -> &MetaManager {
        &self.meta
    }

    #[must_use]
    pub const fn modes(&self) -> &ModeResolver {
        &self.modes
    }

    /// Subscribe to namespace events.
    pub fn events(&self) -> broadcast::Receiver<FsEvent> {
        self.meta.events.subscribe()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }

    /// Stop the delete worker. Pending purge futures fail as cancelled.
    pub fn shutdown(&self) {
        self.worker.shutdown();
        self.tracker.cancel_all();
        info!("GridFS '{}' stopped", self.name);
    }

    // ---- Mode dispatch ----

    fn mode(&self, path: &FsPath) -> Result<FsMode> {
        match self.modes.resolve_mode(path) {
            FsMode::Proxy => Err(Error::ProxyMode(path.to_string())),
            mode => Ok(mode),
        }
    }

    fn secondary_fs(&self) -> Result<&dyn SecondaryFs> {
        self.secondary.as_deref().ok_or_else(|| {
            Error::invalid_argument("no secondary file system configured for DUAL mode")
        })
    }

    /// Whether a DUAL mode applies to `path` or anything below it
    fn has_dual_children(&self, path: &FsPath) -> bool {
        self.modes
            .resolve_children_modes(path)
            .iter()
            .any(|mode| mode.is_dual())
    }

    /// Whether PRIMARY is the only mode at and below `path`
    fn primary_only(&self, path: &FsPath) -> bool {
        self.modes
            .resolve_children_modes(path)
            .iter()
            .all(|mode| *mode == FsMode::Primary)
    }

    /// Fail when a PRIMARY path missing locally exists in the secondary
    /// file system.
    fn check_conflict_with_primary(&self, path: &FsPath) -> Result<()> {
        let Some(fs) = self.secondary.as_deref() else {
            return Ok(());
        };

        match fs.exists(path) {
            Ok(true) => Err(Error::invalid_path(format!(
                "path mapped to a PRIMARY mode found in secondary file system, \
                 remove it or reconfigure the path modes: {path}"
            ))),
            Ok(false) => Ok(()),
            Err(e) => {
                debug!("Conflict check of {} failed: {}", path, e);
                Ok(())
            }
        }
    }

    fn not_found_primary(&self, path: &FsPath, mode: FsMode) -> Error {
        if mode == FsMode::Primary
            && let Err(e) = self.check_conflict_with_primary(path)
        {
            return e;
        }
        Error::not_found(format!("path not found: {path}"))
    }

    /// Leaf ID and parent ID of `path`
    fn leaf_and_parent(&self, path: &FsPath) -> Result<(Option<EntryId>, Option<EntryId>)> {
        let ids = self.meta.file_ids(path)?;
        let leaf = ids.last().copied().flatten();
        let parent = ids
            .len()
            .checked_sub(2)
            .and_then(|idx| ids.get(idx).copied().flatten());
        Ok((leaf, parent))
    }

    fn record(&self, kind: FsEventKind, path: &FsPath) {
        self.meta.events.record(FsEvent::new(kind, path.clone()));
    }

    // ---- Queries ----

    pub fn exists(&self, path: &FsPath) -> Result<bool> {
        let mode = self.mode(path)?;

        if self.meta.file_id(path)?.is_some() {
            return Ok(true);
        }

        if mode.is_dual() {
            return self
                .secondary_fs()?
                .exists(path)
                .map_err(|e| Error::secondary(format!("failed to check existence of {path}"), e));
        }
        Ok(false)
    }

    pub fn info(&self, path: &FsPath) -> Result<Option<FsFile>> {
        let mode = self.mode(path)?;

        match mode {
            FsMode::DualSync => Ok(self
                .meta
                .synchronize_file_dual(self.secondary_fs()?, path)?
                .map(|info| FsFile::from_entry(path.clone(), &info))),
            FsMode::DualAsync => {
                if let Some(info) = self.meta.info_at(path)? {
                    return Ok(Some(FsFile::from_entry(path.clone(), &info)));
                }
                let status = self
                    .secondary_fs()?
                    .status(path)
                    .map_err(|e| Error::secondary(format!("failed to get status of {path}"), e))?;
                Ok(status.map(|s| FsFile::from_status(&s, self.block_size)))
            }
            _ => Ok(self
                .meta
                .info_at(path)?
                .map(|info| FsFile::from_entry(path.clone(), &info))),
        }
    }

    /// File and directory counts and the total file length of a subtree
    pub fn summary(&self, path: &FsPath) -> Result<PathSummary> {
        self.mode(path)?;

        let id = self
            .meta
            .file_id(path)?
            .ok_or_else(|| Error::not_found(format!("failed to get summary (path not found): {path}")))?;

        let mut summary = PathSummary::default();
        self.summarize(id, &mut summary)?;
        Ok(summary)
    }

    fn summarize(&self, id: EntryId, summary: &mut PathSummary) -> Result<()> {
        let Some(info) = self.meta.info(id)? else {
            return Ok(());
        };

        match info.listing() {
            Some(listing) => {
                if !id.is_root() {
                    summary.directories_count += 1;
                }
                for child in listing.values() {
                    self.summarize(child.file_id, summary)?;
                }
            }
            None => {
                summary.files_count += 1;
                summary.total_length += info.length();
            }
        }
        Ok(())
    }

    /// Total file length below `path`, 0 when it does not exist
    pub fn size(&self, path: &FsPath) -> Result<u64> {
        match self.summary(path) {
            Ok(summary) => Ok(summary.total_length),
            Err(Error::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn list_paths(&self, path: &FsPath) -> Result<Vec<FsPath>> {
        let mode = self.mode(path)?;
        let mut names = BTreeSet::new();

        if self.has_dual_children(path) {
            let statuses = self
                .secondary_fs()?
                .list_status(path)
                .map_err(|e| Error::secondary(format!("failed to list {path}"), e))?
                .ok_or_else(|| Error::not_found(format!("failed to list paths (path not found): {path}")))?;
            names.extend(statuses.iter().map(|s| s.path.name().to_string()));
        }

        match self.meta.file_id(path)? {
            Some(id) => names.extend(self.meta.directory_listing(id)?.into_keys()),
            None if mode == FsMode::Primary => return Err(self.not_found_primary(path, mode)),
            None => {}
        }

        names.iter().map(|name| path.child(name)).collect()
    }

    /// Children of a directory, or the file itself for a file path
    pub fn list_files(&self, path: &FsPath) -> Result<Vec<FsFile>> {
        let mode = self.mode(path)?;
        let mut files = BTreeMap::new();

        if self.has_dual_children(path) {
            let statuses = self
                .secondary_fs()?
                .list_status(path)
                .map_err(|e| Error::secondary(format!("failed to list {path}"), e))?
                .ok_or_else(|| Error::not_found(format!("failed to list files (path not found): {path}")))?;
            for status in &statuses {
                files.insert(status.path.clone(), FsFile::from_status(status, self.block_size));
            }
        }

        match self.meta.info_at(path)? {
            Some(info) if info.is_file() => {
                return Ok(vec![FsFile::from_entry(path.clone(), &info)]);
            }
            Some(info) => {
                let listing = info.listing().cloned().unwrap_or_default();
                let ids: Vec<EntryId> = listing.values().map(|e| e.file_id).collect();
                let infos = self.meta.infos(&ids)?;

                for (name, child) in &listing {
                    if let Some(child_info) = infos.get(&child.file_id) {
                        let child_path = path.child(name)?;
                        files.insert(child_path.clone(), FsFile::from_entry(child_path, child_info));
                    }
                }
            }
            None if mode == FsMode::Primary => return Err(self.not_found_primary(path, mode)),
            None => {}
        }

        Ok(files.into_values().collect())
    }

    /// Block placement of a byte range of a file
    pub fn affinity(&self, path: &FsPath, start: u64, len: u64) -> Result<Vec<BlockLocation>> {
        let mode = self.mode(path)?;

        let mut info = self.meta.info_at(path)?;
        if info.is_none() && mode.is_dual() {
            info = self.meta.synchronize_file_dual(self.secondary_fs()?, path)?;
        }

        let info = info.ok_or_else(|| Error::not_found(format!("file not found: {path}")))?;
        if !info.is_file() {
            return Err(Error::invalid_path(format!(
                "failed to get affinity for path because it is not a file: {path}"
            )));
        }

        self.data.affinity(&info, start, len)
    }

    // ---- Namespace changes ----

    /// Merge property updates into an entry; a `None` value removes the key.
    pub fn update(&self, path: &FsPath, updates: &PropertyUpdates) -> Result<Option<FsFile>> {
        if updates.is_empty() {
            return Err(Error::invalid_argument("no properties to update"));
        }

        let mode = self.mode(path)?;
        let updated = if mode.is_dual() {
            self.meta.update_dual(self.secondary_fs()?, path, updates)?
        } else {
            let (leaf, parent) = self.leaf_and_parent(path)?;
            match leaf {
                Some(id) => self.meta.update_properties(parent, id, path.name(), updates)?,
                None => None,
            }
        };

        Ok(updated.map(|info| {
            self.meta
                .events
                .record(FsEvent::meta_updated(path.clone(), info.properties().clone()));
            FsFile::from_entry(path.clone(), &info)
        }))
    }

    /// Set access and modification times; `-1` keeps the current value.
    pub fn set_times(&self, path: &FsPath, access_time: i64, modification_time: i64) -> Result<()> {
        if access_time == -1 && modification_time == -1 {
            return Ok(());
        }
        self.mode(path)?;

        let (leaf, parent) = self.leaf_and_parent(path)?;
        let id = leaf.ok_or_else(|| Error::not_found(format!("failed to update times (path not found): {path}")))?;

        // The root has no listing entry to update
        let Some(parent_id) = parent else {
            self.meta.update_info(id, |root| {
                let atime = if access_time == -1 { root.access_time() } else { access_time };
                let mtime = if modification_time == -1 {
                    root.modification_time()
                } else {
                    modification_time
                };
                root.with_times(atime, mtime)
            })?;
            return Ok(());
        };

        self.meta
            .update_times(parent_id, id, path.name(), access_time, modification_time)
    }

    /// Rename `src` to `dest`, or move it into `dest` when that is an
    /// existing directory.
    pub fn rename(&self, src: &FsPath, dest: &FsPath) -> Result<()> {
        let mode = self.mode(src)?;
        self.mode(dest)?;

        if src == dest {
            return Ok(());
        }
        if src.is_root() {
            return Err(Error::invalid_path("failed to rename the root directory"));
        }
        if dest.is_sub_directory_of(src) {
            return Err(Error::invalid_path(format!(
                "failed to rename {src} into its own subtree: {dest}"
            )));
        }

        if !self.primary_only(src) {
            self.meta.rename_dual(self.secondary_fs()?, src, dest)?;
            LocalMetrics::incr(&self.metrics.renames);
            return Ok(());
        }

        let (leaf, parent) = self.leaf_and_parent(src)?;
        let (Some(src_id), Some(src_parent_id)) = (leaf, parent) else {
            return Err(self.not_found_primary(src, mode));
        };
        let src_info = self
            .meta
            .info(src_id)?
            .ok_or_else(|| Error::not_found(format!("failed to rename (source not found): {src}")))?;

        let (dest_parent_id, dest_name, new_path) = match self.meta.info_at(dest)? {
            None => {
                let parent_path = dest
                    .parent()
                    .ok_or_else(|| Error::invalid_path(format!("invalid destination: {dest}")))?;
                let parent = self.meta.info_at(&parent_path)?.ok_or_else(|| {
                    Error::not_found(format!(
                        "failed to rename (destination directory does not exist): {dest}"
                    ))
                })?;
                if parent.is_file() {
                    return Err(Error::ParentNotDirectory(parent_path.to_string()));
                }
                (parent.id(), dest.name().to_string(), dest.clone())
            }
            Some(existing) if existing.is_file() => {
                return Err(Error::already_exists(format!(
                    "failed to rename (destination is an existing file): {dest}"
                )));
            }
            Some(dir) => (dir.id(), src.name().to_string(), dest.child(src.name())?),
        };

        self.meta
            .move_entry(src_id, src.name(), src_parent_id, &dest_name, dest_parent_id)?;

        let kind = if src_info.is_file() {
            FsEventKind::FileRenamed
        } else {
            FsEventKind::DirRenamed
        };
        self.meta
            .events
            .record(FsEvent::renamed(kind, src.clone(), new_path));
        LocalMetrics::incr(&self.metrics.renames);
        Ok(())
    }

    /// Delete a file or directory. Non-empty directories need `recursive`.
    /// Returns `false` when nothing was deleted.
    pub fn delete(&self, path: &FsPath, recursive: bool) -> Result<bool> {
        let mode = self.mode(path)?;
        let children_modes = self.modes.resolve_children_modes(path);

        let (leaf, parent) = self.leaf_and_parent(path)?;
        let desc = match leaf {
            Some(id) => self.meta.info(id)?,
            None => None,
        };

        let mut res = false;

        if children_modes.contains(&FsMode::Primary) {
            match &desc {
                Some(info) => res = self.delete_local(path, info, parent, recursive)?,
                None if mode == FsMode::Primary => self.check_conflict_with_primary(path)?,
                None => {}
            }
        }

        if children_modes.iter().any(|mode| mode.is_dual()) {
            res |= self.meta.delete_dual(self.secondary_fs()?, path, recursive)?;
        }

        if res {
            LocalMetrics::incr(&self.metrics.deletes);
            if let Some(info) = &desc {
                let kind = if info.is_file() {
                    FsEventKind::FileDeleted
                } else {
                    FsEventKind::DirDeleted
                };
                self.record(kind, path);
            }
        }

        Ok(res)
    }

    fn delete_local(
        &self,
        path: &FsPath,
        info: &Entry,
        parent_id: Option<EntryId>,
        recursive: bool,
    ) -> Result<bool> {
        let Some(parent_id) = parent_id else {
            // Root: only its content goes away
            if recursive {
                return Ok(self.meta.soft_delete(None, None, EntryId::ROOT)?.is_some());
            }
            if info.is_empty_directory() {
                return Ok(false);
            }
            return Err(Error::DirectoryNotEmpty(path.to_string()));
        };

        if info.is_file() || info.is_empty_directory() {
            return Ok(self
                .meta
                .remove_if_empty(parent_id, path.name(), info.id(), path, true)?
                .is_some());
        }

        if !recursive {
            return Err(Error::DirectoryNotEmpty(path.to_string()));
        }

        Ok(self
            .meta
            .soft_delete(Some(parent_id), Some(path.name()), info.id())?
            .is_some())
    }

    /// Create a directory and any missing parents. Defaults to
    /// `permission = 0777` when no properties are given.
    pub fn mkdirs(&self, path: &FsPath, props: Option<&Properties>) -> Result<()> {
        let mode = self.mode(path)?;
        let props = props.cloned().unwrap_or_else(default_dir_props);

        if mode.is_dual() {
            self.meta.mkdirs_dual(self.secondary_fs()?, path, &props)?;
            return Ok(());
        }

        let ids = self.meta.file_ids(path)?;
        let mut parent_id = EntryId::ROOT;
        let mut cur = FsPath::root();

        for (idx, name) in path.components().into_iter().enumerate() {
            cur = cur.child(name)?;

            if let Some(id) = ids.get(idx + 1).copied().flatten() {
                match self.meta.info(id)? {
                    Some(info) if info.is_file() => {
                        return Err(Error::ParentNotDirectory(cur.to_string()));
                    }
                    Some(_) => {
                        parent_id = id;
                        continue;
                    }
                    // Removed since resolution, create it again
                    None => {}
                }
            }

            let dir = Entry::directory(props.clone());
            match self.meta.put_if_absent(parent_id, name, dir.clone())? {
                None => {
                    parent_id = dir.id();
                    LocalMetrics::incr(&self.metrics.dirs_created);
                    self.record(FsEventKind::DirCreated, &cur);
                }
                Some(existing) if existing.is_file() => {
                    return Err(Error::ParentNotDirectory(cur.to_string()));
                }
                Some(existing) => parent_id = existing.id(),
            }
        }

        Ok(())
    }

    // ---- Content streams ----

    pub fn open(&self, path: &FsPath) -> Result<FileReader> {
        let mode = self.mode(path)?;

        if mode.is_dual() {
            let SecondaryInput { info, input } = self.meta.open_dual(self.secondary_fs()?, path)?;
            self.record(FsEventKind::FileOpenedRead, path);
            return Ok(FileReader::from_secondary(
                path.clone(),
                info,
                input,
                Arc::clone(&self.metrics),
            ));
        }

        let Some(info) = self.meta.info_at(path)? else {
            return Err(self.not_found_primary(path, mode));
        };
        if !info.is_file() {
            return Err(Error::invalid_path(format!(
                "failed to open file (not a file): {path}"
            )));
        }

        self.record(FsEventKind::FileOpenedRead, path);
        Ok(FileReader::from_data(
            path.clone(),
            info,
            Arc::clone(&self.data),
            Arc::clone(&self.metrics),
        ))
    }

    pub fn create(&self, path: &FsPath, overwrite: bool) -> Result<FileWriter> {
        self.create_with(path, overwrite, None, None)
    }

    /// Create a file with explicit properties and affinity key. Missing
    /// parents are created with the same properties.
    pub fn create_with(
        &self,
        path: &FsPath,
        overwrite: bool,
        props: Option<&Properties>,
        affinity_key: Option<EntryId>,
    ) -> Result<FileWriter> {
        let mode = self.mode(path)?;
        let parent_path = path
            .parent()
            .ok_or_else(|| Error::invalid_path("failed to create the root directory as a file"))?;

        if mode.is_dual() {
            let permission = props
                .and_then(|p| p.get(PROP_PERMISSION))
                .map(String::as_str)
                .and_then(parse_permission);
            let SecondaryOutput {
                parent_id,
                info,
                out,
                replaced,
            } = self
                .meta
                .create_dual(self.secondary_fs()?, path, overwrite, permission, affinity_key)?;

            if let Some(old) = replaced {
                match self.data.delete(&old) {
                    Ok(()) => self.record(FsEventKind::FilePurged, path),
                    Err(e) => warn!("Failed to purge data of replaced file {}: {}", old.id(), e),
                }
            }

            LocalMetrics::incr(&self.metrics.files_created);
            self.record(FsEventKind::FileOpenedWrite, path);
            return Ok(FileWriter::new(
                Arc::clone(&self.meta),
                Arc::clone(&self.data),
                path.clone(),
                parent_id,
                info,
                Some(out),
            ));
        }

        self.mkdirs(&parent_path, props)?;

        let (_, parent) = self.leaf_and_parent(path)?;
        let parent_id = parent.ok_or_else(|| {
            Error::not_found(format!("failed to create file (parent was removed): {path}"))
        })?;

        let info = Entry::file(
            self.block_size,
            0,
            affinity_key,
            props.cloned().unwrap_or_default(),
        );

        while let Some(old) = self.meta.put_if_absent(parent_id, path.name(), info.clone())? {
            if old.is_directory() {
                return Err(Error::already_exists(format!(
                    "failed to create file (path points to a directory): {path}"
                )));
            }
            if !overwrite {
                return Err(Error::already_exists(format!(
                    "failed to create file (file already exists): {path}"
                )));
            }

            if self
                .meta
                .remove_if_empty(parent_id, path.name(), old.id(), path, false)?
                .is_some()
            {
                self.record(FsEventKind::FileDeleted, path);
            }
        }

        LocalMetrics::incr(&self.metrics.files_created);
        self.record(FsEventKind::FileCreated, path);

        let locked = self.meta.lock(info.id())?;
        self.record(FsEventKind::FileOpenedWrite, path);

        Ok(FileWriter::new(
            Arc::clone(&self.meta),
            Arc::clone(&self.data),
            path.clone(),
            parent_id,
            locked,
            None,
        ))
    }

    /// Open a file for appending, creating it when `create` is set.
    pub fn append(&self, path: &FsPath, create: bool) -> Result<FileWriter> {
        let mode = self.mode(path)?;

        if mode.is_dual() {
            let SecondaryOutput {
                parent_id,
                info,
                out,
                ..
            } = self.meta.append_dual(self.secondary_fs()?, path)?;

            self.record(FsEventKind::FileOpenedWrite, path);
            return Ok(FileWriter::new(
                Arc::clone(&self.meta),
                Arc::clone(&self.data),
                path.clone(),
                parent_id,
                info,
                Some(out),
            ));
        }

        let (leaf, parent) = self.leaf_and_parent(path)?;
        let existing = match leaf {
            Some(id) => self.meta.info(id)?,
            None => None,
        };

        let info = match existing {
            Some(info) => info,
            None if !create => return Err(self.not_found_primary(path, mode)),
            None => {
                let parent_id = parent.ok_or_else(|| {
                    Error::invalid_path(format!("failed to resolve parent directory: {path}"))
                })?;
                let info = Entry::file(self.block_size, 0, None, Properties::new());
                match self.meta.put_if_absent(parent_id, path.name(), info.clone())? {
                    Some(old) => old,
                    None => {
                        LocalMetrics::incr(&self.metrics.files_created);
                        self.record(FsEventKind::FileCreated, path);
                        info
                    }
                }
            }
        };

        if !info.is_file() {
            return Err(Error::invalid_path(format!(
                "failed to open file (not a file): {path}"
            )));
        }

        let parent_id = parent.ok_or_else(|| {
            Error::invalid_path(format!("failed to resolve parent directory: {path}"))
        })?;
        let locked = self.meta.lock(info.id())?;
        self.record(FsEventKind::FileOpenedWrite, path);

        Ok(FileWriter::new(
            Arc::clone(&self.meta),
            Arc::clone(&self.data),
            path.clone(),
            parent_id,
            locked,
            None,
        ))
    }

    // ---- Format and purge tracking ----

    fn await_purge(&self, id: EntryId) -> oneshot::Receiver<()> {
        let rx = self.tracker.register(id);
        // Already purged before the waiter was in place
        if !self.meta.exists(id) {
            self.tracker.complete(id);
        }
        rx
    }

    /// Move everything below the root into trash. The future completes
    /// once the delete worker has purged it.
    pub fn format(&self) -> BoxFuture<'static, Result<()>> {
        match self.meta.soft_delete(None, None, EntryId::ROOT) {
            Ok(Some(id)) => {
                info!("Formatting GridFS '{}'", self.name);
                self.await_purge(id).map_err(|_| cancelled()).boxed()
            }
            Ok(None) => future::ok(()).boxed(),
            Err(e) => future::err(e).boxed(),
        }
    }

    /// Future completing once every entry currently in trash is purged.
    pub fn await_deletes_async(&self) -> BoxFuture<'static, Result<()>> {
        let ids = match self.meta.pending_deletes() {
            Ok(ids) => ids,
            Err(e) => return future::err(e).boxed(),
        };

        let waits: Vec<_> = ids.into_iter().map(|id| self.await_purge(id)).collect();
        future::try_join_all(waits)
            .map_ok(|_| ())
            .map_err(|_| cancelled())
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryDataManager;
    use gridfs_common::config::PathModeConfig;
    use std::io::{Read, Write};
    use std::time::Duration;

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap()
    }

    fn config() -> FsConfig {
        let mut config = FsConfig::default();
        config.block_size = 8;
        config.delete_worker.rescan_interval_ms = 20;
        config
    }

    fn setup() -> (GridFs, Arc<MemoryDataManager>) {
        let data = Arc::new(MemoryDataManager::default());
        let fs = GridFs::new(config(), EntryStore::in_memory(), None, data.clone()).unwrap();
        (fs, data)
    }

    fn write_file(fs: &GridFs, path: &str, content: &[u8]) {
        let mut writer = fs.create(&p(path), true).unwrap();
        writer.write_all(content).unwrap();
        writer.close().unwrap();
    }

    fn read_file(fs: &GridFs, path: &str) -> Vec<u8> {
        let mut reader = fs.open(&p(path)).unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).unwrap();
        content
    }

    #[test]
    fn test_open_store_reopens_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.store.data_path = Some(dir.path().join("meta.redb"));
        let data = Arc::new(MemoryDataManager::default());

        {
            let fs = GridFs::open_store(config.clone(), None, data.clone()).unwrap();
            write_file(&fs, "/a/f", b"abc");
            fs.shutdown();
        }

        let fs = GridFs::open_store(config, None, data).unwrap();
        assert_eq!(fs.info(&p("/a/f")).unwrap().unwrap().length, 3);
        assert_eq!(read_file(&fs, "/a/f"), b"abc");
    }

    #[test]
    fn test_create_write_read_list() {
        let (fs, _data) = setup();

        fs.mkdirs(&p("/a/b"), None).unwrap();
        write_file(&fs, "/a/b/f1", b"hello");
        write_file(&fs, "/a/f2", b"world!");

        assert_eq!(read_file(&fs, "/a/b/f1"), b"hello");
        assert!(fs.exists(&p("/a/b/f1")).unwrap());
        assert!(!fs.exists(&p("/a/nope")).unwrap());

        let info = fs.info(&p("/a/b")).unwrap().unwrap();
        assert!(info.is_directory);
        assert_eq!(info.properties.get(PROP_PERMISSION).map(String::as_str), Some("0777"));

        let paths = fs.list_paths(&p("/a")).unwrap();
        assert_eq!(paths, vec![p("/a/b"), p("/a/f2")]);

        let files = fs.list_files(&p("/a")).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].length, 6);
        assert_eq!(fs.list_files(&p("/a/f2")).unwrap()[0].path, p("/a/f2"));

        let summary = fs.summary(&p("/")).unwrap();
        assert_eq!(
            summary,
            PathSummary {
                files_count: 2,
                directories_count: 2,
                total_length: 11,
            }
        );
        assert_eq!(fs.size(&p("/a/b")).unwrap(), 5);
        assert_eq!(fs.size(&p("/missing")).unwrap(), 0);
        assert!(matches!(fs.list_paths(&p("/missing")), Err(Error::NotFound(_))));

        let metrics = fs.metrics();
        assert_eq!(metrics.files_created, 2);
        assert_eq!(metrics.dirs_created, 2);
        assert_eq!(metrics.files_opened_for_write, 0);
    }

    #[test]
    fn test_create_existing_file() {
        let (fs, _data) = setup();
        write_file(&fs, "/f", b"first");

        assert!(matches!(fs.create(&p("/f"), false), Err(Error::AlreadyExists(_))));

        let old_id = fs.meta().file_id(&p("/f")).unwrap().unwrap();
        write_file(&fs, "/f", b"second");
        let new_id = fs.meta().file_id(&p("/f")).unwrap().unwrap();
        assert_ne!(old_id, new_id);
        assert_eq!(read_file(&fs, "/f"), b"second");

        fs.mkdirs(&p("/d"), None).unwrap();
        assert!(matches!(fs.create(&p("/d"), true), Err(Error::AlreadyExists(_))));
        assert!(matches!(fs.create(&p("/f/x"), true), Err(Error::ParentNotDirectory(_))));
    }

    #[test]
    fn test_file_locked_while_writing() {
        let (fs, _data) = setup();

        let writer = fs.create(&p("/f"), false).unwrap();
        assert!(matches!(fs.append(&p("/f"), false), Err(Error::FileLocked(_))));
        drop(writer);

        let mut writer = fs.append(&p("/f"), false).unwrap();
        writer.write_all(b"tail").unwrap();
        writer.close().unwrap();
        assert_eq!(fs.info(&p("/f")).unwrap().unwrap().length, 4);

        assert!(matches!(fs.append(&p("/g"), false), Err(Error::NotFound(_))));
        let mut writer = fs.append(&p("/g"), true).unwrap();
        writer.write_all(b"new").unwrap();
        drop(writer);
        assert_eq!(read_file(&fs, "/g"), b"new");

        fs.mkdirs(&p("/d"), None).unwrap();
        assert!(matches!(fs.append(&p("/d"), false), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.open(&p("/d")), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_rename_keeps_id() {
        let (fs, _data) = setup();
        fs.mkdirs(&p("/a"), None).unwrap();
        fs.mkdirs(&p("/b"), None).unwrap();
        write_file(&fs, "/a/f", b"data");
        let updates = PropertyUpdates::from([("owner".to_string(), Some("alice".to_string()))]);
        fs.update(&p("/a/f"), &updates).unwrap();
        let before = fs.info(&p("/a/f")).unwrap().unwrap();
        let id = fs.meta().file_id(&p("/a/f")).unwrap();

        let mut events = fs.events();
        fs.rename(&p("/a/f"), &p("/b/f")).unwrap();
        assert_eq!(fs.meta().file_id(&p("/b/f")).unwrap(), id);
        assert!(!fs.exists(&p("/a/f")).unwrap());

        let after = fs.info(&p("/b/f")).unwrap().unwrap();
        assert_eq!(after.file_id, before.file_id);
        assert_eq!(after.length, 4);
        assert_eq!(after.length, before.length);
        assert_eq!(after.block_size, before.block_size);
        assert_eq!(after.properties, before.properties);
        assert_eq!(after.properties.get("owner").map(String::as_str), Some("alice"));
        assert_eq!(after.modification_time, before.modification_time);
        assert_eq!(read_file(&fs, "/b/f"), b"data");

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, FsEventKind::FileRenamed);
        assert_eq!(event.new_path, Some(p("/b/f")));

        // Into an existing directory under the source name
        fs.rename(&p("/b/f"), &p("/a")).unwrap();
        assert_eq!(fs.meta().file_id(&p("/a/f")).unwrap(), id);

        write_file(&fs, "/a/g", b"x");
        assert!(matches!(fs.rename(&p("/a/f"), &p("/a/g")), Err(Error::AlreadyExists(_))));
        assert!(matches!(fs.rename(&p("/a"), &p("/a/sub")), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.rename(&p("/"), &p("/x")), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.rename(&p("/nope"), &p("/x")), Err(Error::NotFound(_))));
        assert!(matches!(fs.rename(&p("/a/f"), &p("/nope/x")), Err(Error::NotFound(_))));
        fs.rename(&p("/a/f"), &p("/a/f")).unwrap();
    }

    #[test]
    fn test_delete() {
        let (fs, _data) = setup();
        fs.mkdirs(&p("/d/e"), None).unwrap();
        write_file(&fs, "/d/e/f", b"data");

        assert!(matches!(fs.delete(&p("/d"), false), Err(Error::DirectoryNotEmpty(_))));
        assert!(fs.delete(&p("/d/e/f"), false).unwrap());
        assert!(fs.delete(&p("/d/e"), false).unwrap());
        assert!(!fs.delete(&p("/d/e"), false).unwrap());

        write_file(&fs, "/d/x/y", b"data");
        let mut events = fs.events();
        assert!(fs.delete(&p("/d"), true).unwrap());
        assert!(!fs.exists(&p("/d")).unwrap());
        // The worker may publish purge events in between
        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .filter(|kind| *kind != FsEventKind::FilePurged)
            .collect();
        assert_eq!(kinds, vec![FsEventKind::DirDeleted]);
        assert_eq!(fs.metrics().deletes, 3);
    }

    #[test]
    fn test_update_and_set_times() {
        let (fs, _data) = setup();
        write_file(&fs, "/f", b"abc");

        let updates = PropertyUpdates::from([
            ("owner".to_string(), Some("alice".to_string())),
            ("missing".to_string(), None),
        ]);
        let updated = fs.update(&p("/f"), &updates).unwrap().unwrap();
        assert_eq!(updated.properties.get("owner").map(String::as_str), Some("alice"));
        assert!(fs.update(&p("/nope"), &updates).unwrap().is_none());
        assert!(matches!(
            fs.update(&p("/f"), &PropertyUpdates::new()),
            Err(Error::InvalidArgument(_))
        ));

        fs.set_times(&p("/f"), 1000, -1).unwrap();
        let info = fs.info(&p("/f")).unwrap().unwrap();
        assert_eq!(info.access_time, 1000);
        assert!(info.modification_time > 0);

        fs.set_times(&p("/"), 1, 1).unwrap();
        fs.set_times(&p("/"), 5, -1).unwrap();
        let root = fs.meta().info(EntryId::ROOT).unwrap().unwrap();
        assert_eq!((root.access_time(), root.modification_time()), (5, 1));

        assert!(matches!(fs.set_times(&p("/nope"), 1, 1), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_affinity() {
        let (fs, _data) = setup();
        write_file(&fs, "/f", &[7u8; 20]);

        let locations = fs.affinity(&p("/f"), 0, 20).unwrap();
        assert_eq!(locations.len(), 3);
        assert_eq!(locations[2].len, 4);

        fs.mkdirs(&p("/d"), None).unwrap();
        assert!(matches!(fs.affinity(&p("/d"), 0, 1), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.affinity(&p("/nope"), 0, 1), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_proxy_paths_rejected() {
        let mut config = config();
        config.path_modes.push(PathModeConfig {
            path: "/proxy".to_string(),
            mode: FsMode::Proxy,
        });
        let fs = GridFs::new(
            config,
            EntryStore::in_memory(),
            None,
            Arc::new(MemoryDataManager::default()),
        )
        .unwrap();

        assert!(matches!(fs.exists(&p("/proxy/f")), Err(Error::ProxyMode(_))));
        assert!(matches!(fs.mkdirs(&p("/proxy"), None), Err(Error::ProxyMode(_))));
        fs.mkdirs(&p("/other"), None).unwrap();
    }

    #[test]
    fn test_dual_requires_secondary() {
        let mut config = config();
        config.default_mode = FsMode::DualSync;
        let res = GridFs::new(
            config,
            EntryStore::in_memory(),
            None,
            Arc::new(MemoryDataManager::default()),
        );
        assert!(matches!(res, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_format_purges_everything() {
        let (fs, data) = setup();
        fs.mkdirs(&p("/a/b"), None).unwrap();
        write_file(&fs, "/a/b/f", b"data");
        write_file(&fs, "/g", b"more");
        assert_eq!(data.files(), 2);

        tokio::time::timeout(Duration::from_secs(10), fs.format())
            .await
            .unwrap()
            .unwrap();

        assert!(fs.list_paths(&p("/")).unwrap().is_empty());
        assert_eq!(data.files(), 0);
        assert!(fs.meta().pending_deletes().unwrap().is_empty());

        // Nothing left to format
        fs.format().await.unwrap();
    }

    #[tokio::test]
    async fn test_await_deletes() {
        let data = Arc::new(MemoryDataManager::default());
        let store = EntryStore::in_memory();

        // Trash stays in place while no worker runs
        let stopped = GridFs::new(config(), store.clone(), None, data.clone()).unwrap();
        stopped.shutdown();
        stopped.mkdirs(&p("/d"), None).unwrap();
        for i in 0..5 {
            write_file(&stopped, &format!("/d/f{i}"), b"x");
        }
        let id = stopped.meta().file_id(&p("/d")).unwrap().unwrap();

        assert!(stopped.delete(&p("/d"), true).unwrap());
        assert!(!stopped.exists(&p("/d")).unwrap());
        assert_eq!(stopped.meta().pending_deletes().unwrap(), vec![id]);
        assert_eq!(data.files(), 5);

        let fs = GridFs::new(config(), store, None, data.clone()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), fs.await_deletes_async())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(data.files(), 0);
        assert!(fs.meta().pending_deletes().unwrap().is_empty());
        assert!(fs.await_deletes_async().await.is_ok());
    }

    /// Walk the tree and check every child resolves exactly once.
    fn assert_tree_consistent(fs: &GridFs) {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![EntryId::ROOT];

        while let Some(id) = stack.pop() {
            assert!(seen.insert(id), "entry {id} reachable twice");
            let info = fs.meta().info(id).unwrap().unwrap();
            for (name, child) in info.listing().cloned().unwrap_or_default() {
                let child_info = fs.meta().info(child.file_id).unwrap();
                assert!(child_info.is_some(), "dangling child {name}");
                assert_eq!(child_info.unwrap().is_directory(), child.is_directory);
                stack.push(child.file_id);
            }
        }
    }

    #[tokio::test]
    async fn test_random_concurrent_operations() {
        use rand::Rng;

        let (fs, data) = setup();
        for d in 0..4 {
            fs.mkdirs(&p(&format!("/d{d}")), None).unwrap();
        }
        let fs = Arc::new(fs);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let fs = Arc::clone(&fs);
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut random_path = |prefix: &str| {
                        p(&format!("/d{}/{prefix}{}", rng.gen_range(0..4), rng.gen_range(0..4)))
                    };

                    for i in 0..200 {
                        let file = random_path("f");
                        let other = random_path("f");
                        let dir = random_path("s");

                        let _ = match i % 5 {
                            0 => fs.create(&file, true).and_then(|mut w| {
                                w.write_all(b"content")?;
                                w.close()
                            }),
                            1 => fs.rename(&file, &other),
                            2 => fs.delete(&file, false).map(|_| ()),
                            3 => fs.mkdirs(&dir.child("x").unwrap(), None),
                            _ => fs.delete(&dir, true).map(|_| ()),
                        };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_tree_consistent(&fs);

        fs.delete(&p("/"), true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), fs.await_deletes_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.files(), 0);
        assert_eq!(fs.meta().store().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let (fs, _data) = setup();
        fs.shutdown();

        write_file(&fs, "/f", b"x");
        fs.delete(&p("/f"), false).unwrap();

        let wait = fs.await_deletes_async();
        fs.shutdown();
        assert!(matches!(wait.await, Err(Error::Cancelled(_))));
    }
}

#[cfg(all(test, unix))]
mod dual_tests {
    use super::*;
    use crate::data::MemoryDataManager;
    use crate::secondary::LocalSecondaryFs;
    use gridfs_common::config::PathModeConfig;
    use std::io::{Read, Write};

    fn p(s: &str) -> FsPath {
        FsPath::new(s).unwrap()
    }

    fn setup() -> (tempfile::TempDir, Arc<LocalSecondaryFs>, GridFs) {
        let dir = tempfile::tempdir().unwrap();
        let secondary = Arc::new(LocalSecondaryFs::new(dir.path().join("secondary")).unwrap());

        let mut config = FsConfig::default();
        config.path_modes.push(PathModeConfig {
            path: "/dual".to_string(),
            mode: FsMode::DualSync,
        });

        let fs = GridFs::new(
            config,
            EntryStore::in_memory(),
            Some(secondary.clone() as Arc<dyn SecondaryFs>),
            Arc::new(MemoryDataManager::default()),
        )
        .unwrap();
        (dir, secondary, fs)
    }

    #[test]
    fn test_dual_write_through() {
        let (_dir, secondary, fs) = setup();

        let mut writer = fs.create(&p("/dual/x/f"), false).unwrap();
        writer.write_all(b"payload").unwrap();
        writer.close().unwrap();

        let status = secondary.status(&p("/dual/x/f")).unwrap().unwrap();
        assert_eq!(status.len, 7);
        assert!(fs.meta().file_id(&p("/dual/x/f")).unwrap().is_some());

        let mut content = String::new();
        fs.open(&p("/dual/x/f")).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "payload");
    }

    #[test]
    fn test_dual_overwrite_purges_replaced_file() {
        let (_dir, secondary, fs) = setup();

        let mut writer = fs.create(&p("/dual/f"), false).unwrap();
        writer.write_all(b"old content").unwrap();
        writer.close().unwrap();
        let old_id = fs.meta().file_id(&p("/dual/f")).unwrap().unwrap();

        let mut events = fs.events();
        let mut writer = fs.create(&p("/dual/f"), true).unwrap();
        writer.write_all(b"new").unwrap();
        writer.close().unwrap();

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert!(kinds.contains(&FsEventKind::FileDeleted));
        assert!(kinds.contains(&FsEventKind::FilePurged));

        assert!(!fs.meta().exists(old_id));
        assert_eq!(secondary.status(&p("/dual/f")).unwrap().unwrap().len, 3);
        let mut content = String::new();
        fs.open(&p("/dual/f")).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "new");
    }

    #[test]
    fn test_listing_merges_secondary() {
        let (_dir, secondary, fs) = setup();

        secondary.mkdirs(&p("/dual/remote"), None).unwrap();
        fs.mkdirs(&p("/local"), None).unwrap();

        let paths = fs.list_paths(&p("/")).unwrap();
        assert!(paths.contains(&p("/dual")));
        assert!(paths.contains(&p("/local")));

        assert_eq!(fs.list_paths(&p("/dual")).unwrap(), vec![p("/dual/remote")]);
        assert!(fs.exists(&p("/dual/remote")).unwrap());
        assert!(fs.info(&p("/dual/remote")).unwrap().unwrap().is_directory);
    }

    #[test]
    fn test_primary_conflict_detected() {
        let (_dir, secondary, fs) = setup();

        secondary.mkdirs(&p("/shadow"), None).unwrap();
        assert!(matches!(fs.list_paths(&p("/shadow")), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.open(&p("/shadow")), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.list_paths(&p("/absent")), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_dual_delete_and_rename() {
        let (_dir, secondary, fs) = setup();
        fs.mkdirs(&p("/dual/a"), None).unwrap();
        let mut writer = fs.create(&p("/dual/a/f"), false).unwrap();
        writer.write_all(b"x").unwrap();
        writer.close().unwrap();

        fs.rename(&p("/dual/a/f"), &p("/dual/g")).unwrap();
        assert!(secondary.exists(&p("/dual/g")).unwrap());
        assert!(fs.meta().file_id(&p("/dual/g")).unwrap().is_some());

        assert!(fs.delete(&p("/dual/a"), true).unwrap());
        assert!(!secondary.exists(&p("/dual/a")).unwrap());
        assert!(!fs.exists(&p("/dual/a")).unwrap());
    }
}
