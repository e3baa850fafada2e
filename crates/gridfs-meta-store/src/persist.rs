//! Persistent entry storage backed by redb.
//!
//! Committed write sets are written here before they become visible in
//! memory. On open the whole table is loaded back; the in-memory map in
//! `EntryStore` remains the read path.

use crate::tables;
use gridfs_common::{Entry, EntryId, Error};
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::error;

/// Error type for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for PersistError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<PersistError> for Error {
    fn from(e: PersistError) -> Self {
        Self::storage(e.to_string())
    }
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Entry table on disk
pub struct PersistentEntries {
    db: Database,
}

impl PersistentEntries {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::ENTRIES)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Write a committed write set. `None` removes the key.
    pub fn apply(&self, writes: &[(EntryId, Option<Entry>)]) -> PersistResult<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::ENTRIES)?;
            for (id, entry) in writes {
                let key = id.to_string();
                match entry {
                    Some(entry) => {
                        let bytes = bincode::serialize(entry)?;
                        table.insert(key.as_str(), bytes.as_slice())?;
                    }
                    None => {
                        table.remove(key.as_str())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load every stored entry. Undecodable records are logged and skipped.
    pub fn load(&self) -> PersistResult<Vec<Entry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::ENTRIES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let key = entry.0.value().to_string();
            match bincode::deserialize::<Entry>(entry.1.value()) {
                Ok(val) => result.push(val),
                Err(e) => error!("Failed to decode entry '{}': {}", key, e),
            }
        }
        Ok(result)
    }
}
