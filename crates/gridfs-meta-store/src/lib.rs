//! GridFS Meta Store - transactional entry storage
//!
//! This crate provides the transactional key-value map the metadata
//! manager builds the namespace tree on: pessimistic per-key locks,
//! buffered writes with atomic commit, and optional redb persistence.

pub mod lock;
pub mod persist;
pub mod store;
pub mod tables;

pub use persist::{PersistError, PersistResult, PersistentEntries};
pub use store::{EntryStore, Tx};
