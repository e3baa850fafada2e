//! GridFS Meta - namespace metadata manager
//!
//! This crate keeps the file system namespace as a tree of entries in a
//! transactional entry store:
//! - Path resolution, entry creation, moves and soft deletes in
//!   deadlock-free transactions
//! - Background reclamation of trashed entries
//! - Mirroring of a secondary file system for DUAL mode paths
//! - The [`GridFs`] facade dispatching operations per path mode

pub mod data;
pub mod delete_worker;
pub mod dual;
pub mod events;
pub mod fs;
pub mod manager;
pub mod metrics;
pub mod mode;
pub mod secondary;
pub mod stream;
pub mod update;

pub use data::{BlockLocation, DataManager, MemoryDataManager};
pub use delete_worker::{DeleteTracker, DeleteWorker};
pub use events::{EventBus, FsEvent, FsEventKind};
pub use fs::{FsFile, GridFs, PathSummary};
pub use manager::{Listing, MetaManager};
pub use metrics::{LocalMetrics, MetricsSnapshot};
pub use mode::ModeResolver;
pub use secondary::{FileStatus, SecondaryFs};
pub use stream::{FileReader, FileWriter};

#[cfg(unix)]
pub use secondary::LocalSecondaryFs;
