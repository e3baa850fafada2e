//! Namespace events
//!
//! Operations publish events after their transaction commits. Delivery is
//! best effort: slow subscribers lag and lose events, and publishing with
//! no subscriber is a no-op.

use gridfs_common::{FsPath, Properties};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events kept for lagging subscribers
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FsEventKind {
    DirCreated,
    DirRenamed,
    DirDeleted,
    FileCreated,
    FileRenamed,
    FileDeleted,
    FilePurged,
    FileOpenedRead,
    FileOpenedWrite,
    FileClosedWrite,
    MetaUpdated,
}

/// Namespace change notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: FsPath,
    /// Destination of renames
    pub new_path: Option<FsPath>,
    /// Properties of metadata updates
    pub properties: Option<Properties>,
}

impl FsEvent {
    #[must_use]
    pub const fn new(kind: FsEventKind, path: FsPath) -> Self {
        Self {
            kind,
            path,
            new_path: None,
            properties: None,
        }
    }

    #[must_use]
    pub const fn renamed(kind: FsEventKind, path: FsPath, new_path: FsPath) -> Self {
        Self {
            kind,
            path,
            new_path: Some(new_path),
            properties: None,
        }
    }

    #[must_use]
    pub const fn meta_updated(path: FsPath, properties: Properties) -> Self {
        Self {
            kind: FsEventKind::MetaUpdated,
            path,
            new_path: None,
            properties: Some(properties),
        }
    }
}

/// Broadcast channel for namespace events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FsEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FsEvent> {
        self.tx.subscribe()
    }

    pub fn record(&self, event: FsEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }

    pub fn record_all(&self, events: impl IntoIterator<Item = FsEvent>) {
        for event in events {
            self.record(event);
        }
    }
}
