//! Core type definitions for GridFS
//!
//! This module defines the entry identifiers and the immutable entry records
//! that make up the namespace tree, plus the operating modes a path can be
//! mapped to.

use crate::path::FsPath;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Permission property key
pub const PROP_PERMISSION: &str = "permission";
/// Owner property key
pub const PROP_USER_NAME: &str = "usrName";
/// Group property key
pub const PROP_GROUP_NAME: &str = "grpName";
/// Permission assigned to directories created without explicit properties
pub const DEFAULT_DIR_PERMISSION: &str = "0777";

/// Entry properties: permissions, owner and group
pub type Properties = BTreeMap<String, String>;

/// Property changes: `None` removes the key
pub type PropertyUpdates = BTreeMap<String, Option<String>>;

/// Current wall clock time in milliseconds since the epoch
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Unique identifier of a namespace entry
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Well-known ID of the namespace root
    pub const ROOT: Self = Self(Uuid::from_u128(0));

    /// Well-known ID of the trash directory
    pub const TRASH: Self = Self(Uuid::from_u128(1));

    /// Generate a new random entry ID
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }

    #[must_use]
    pub fn is_trash(&self) -> bool {
        *self == Self::TRASH
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Operating mode of a namespace region
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FsMode {
    /// Local metadata only
    #[display("PRIMARY")]
    Primary,
    /// Synchronized with the secondary file system, writes go through
    #[display("DUAL_SYNC")]
    DualSync,
    /// Synchronized with the secondary file system, data flushed lazily
    #[display("DUAL_ASYNC")]
    DualAsync,
    /// Requests are served by the secondary file system only
    #[display("PROXY")]
    Proxy,
}

impl FsMode {
    #[must_use]
    pub const fn is_dual(self) -> bool {
        matches!(self, Self::DualSync | Self::DualAsync)
    }
}

/// Child reference stored in a directory listing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub file_id: EntryId,
    pub is_directory: bool,
    pub length: u64,
    pub access_time: i64,
    pub modification_time: i64,
}

impl ListingEntry {
    #[must_use]
    pub const fn is_file(&self) -> bool {
        !self.is_directory
    }

    /// Copy of this listing entry with its length shifted by `delta`.
    #[must_use]
    pub const fn with_length_delta(&self, delta: i64) -> Self {
        Self {
            length: self.length.saturating_add_signed(delta),
            ..*self
        }
    }
}

impl From<&Entry> for ListingEntry {
    fn from(entry: &Entry) -> Self {
        Self {
            file_id: entry.id,
            is_directory: entry.is_directory(),
            length: entry.length,
            access_time: entry.access_time,
            modification_time: entry.modification_time,
        }
    }
}

/// Immutable metadata record of a file or directory
///
/// Every change produces a new value through one of the `with_*` methods;
/// the store replaces the old record under the same ID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    id: EntryId,
    listing: Option<BTreeMap<String, ListingEntry>>,
    length: u64,
    block_size: u32,
    affinity_key: Option<EntryId>,
    lock_id: Option<Uuid>,
    properties: Properties,
    access_time: i64,
    modification_time: i64,
    path: Option<FsPath>,
}

impl Entry {
    /// New empty directory with a random ID
    #[must_use]
    pub fn directory(properties: Properties) -> Self {
        Self::directory_with_id(EntryId::random(), BTreeMap::new(), properties)
    }

    /// Directory with an explicit ID and listing
    #[must_use]
    pub fn directory_with_id(
        id: EntryId,
        listing: BTreeMap<String, ListingEntry>,
        properties: Properties,
    ) -> Self {
        let now = now_millis();

        Self {
            id,
            listing: Some(listing),
            length: 0,
            block_size: 0,
            affinity_key: None,
            lock_id: None,
            properties,
            access_time: now,
            modification_time: now,
            path: None,
        }
    }

    /// New file with a random ID
    #[must_use]
    pub fn file(
        block_size: u32,
        length: u64,
        affinity_key: Option<EntryId>,
        properties: Properties,
    ) -> Self {
        let now = now_millis();

        Self {
            id: EntryId::random(),
            listing: None,
            length,
            block_size,
            affinity_key,
            lock_id: None,
            properties,
            access_time: now,
            modification_time: now,
            path: None,
        }
    }

    /// Empty root directory
    #[must_use]
    pub fn root() -> Self {
        Self::directory_with_id(EntryId::ROOT, BTreeMap::new(), Properties::new())
    }

    /// Empty trash directory
    #[must_use]
    pub fn trash() -> Self {
        Self::directory_with_id(EntryId::TRASH, BTreeMap::new(), Properties::new())
    }

    #[must_use]
    pub const fn id(&self) -> EntryId {
        self.id
    }

    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.listing.is_some()
    }

    #[must_use]
    pub const fn is_file(&self) -> bool {
        self.listing.is_none()
    }

    /// Directory listing, `None` for files
    #[must_use]
    pub const fn listing(&self) -> Option<&BTreeMap<String, ListingEntry>> {
        self.listing.as_ref()
    }

    /// Listing entry registered under `name`
    #[must_use]
    pub fn listing_entry(&self, name: &str) -> Option<&ListingEntry> {
        self.listing.as_ref().and_then(|l| l.get(name))
    }

    /// Whether this is a directory with no children
    #[must_use]
    pub fn is_empty_directory(&self) -> bool {
        self.listing.as_ref().is_some_and(BTreeMap::is_empty)
    }

    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    #[must_use]
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of data blocks the file spans
    #[must_use]
    pub const fn blocks_count(&self) -> u64 {
        if self.block_size == 0 {
            0
        } else {
            self.length.div_ceil(self.block_size as u64)
        }
    }

    #[must_use]
    pub const fn affinity_key(&self) -> Option<EntryId> {
        self.affinity_key
    }

    /// ID of the writer lock, set while a writer holds the file
    #[must_use]
    pub const fn lock_id(&self) -> Option<Uuid> {
        self.lock_id
    }

    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.lock_id.is_some()
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    #[must_use]
    pub const fn access_time(&self) -> i64 {
        self.access_time
    }

    #[must_use]
    pub const fn modification_time(&self) -> i64 {
        self.modification_time
    }

    /// Original path, set once the entry is moved to trash
    #[must_use]
    pub const fn path(&self) -> Option<&FsPath> {
        self.path.as_ref()
    }

    #[must_use]
    pub fn with_listing(&self, listing: BTreeMap<String, ListingEntry>) -> Self {
        debug_assert!(self.is_directory(), "listing is only defined for directories");

        Self {
            listing: Some(listing),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_lock(&self, lock_id: Option<Uuid>) -> Self {
        Self {
            lock_id,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_length(&self, length: u64) -> Self {
        Self {
            length,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_properties(&self, properties: Properties) -> Self {
        Self {
            properties,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_times(&self, access_time: i64, modification_time: i64) -> Self {
        Self {
            access_time,
            modification_time,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_path(&self, path: FsPath) -> Self {
        Self {
            path: Some(path),
            ..self.clone()
        }
    }
}
