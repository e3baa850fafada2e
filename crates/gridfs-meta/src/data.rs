//! File content storage seam
//!
//! The metadata layer never stores file content itself. It calls a
//! `DataManager` to read and write blocks, to purge the data of deleted
//! files, and to report block placement.

use dashmap::DashMap;
use gridfs_common::{Entry, EntryId, Error, Result};
use serde::{Deserialize, Serialize};

/// Placement of a contiguous byte range of a file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub start: u64,
    pub len: u64,
    pub hosts: Vec<String>,
}

/// File content storage
pub trait DataManager: Send + Sync {
    /// Write `data` at `offset` of the file.
    fn write(&self, entry: &Entry, offset: u64, data: &[u8]) -> Result<()>;

    /// Read into `buf` from `offset`; returns the number of bytes read.
    fn read(&self, entry: &Entry, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Drop all content of the file.
    fn delete(&self, entry: &Entry) -> Result<()>;

    /// Placement of the `[start, start + len)` range, one location per block.
    fn affinity(&self, entry: &Entry, start: u64, len: u64) -> Result<Vec<BlockLocation>>;
}

/// Process-local content storage
pub struct MemoryDataManager {
    host: String,
    blocks: DashMap<EntryId, Vec<u8>>,
}

impl MemoryDataManager {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            blocks: DashMap::new(),
        }
    }

    /// Number of files with stored content
    #[must_use]
    pub fn files(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.blocks.contains_key(&id)
    }
}

impl Default for MemoryDataManager {
    fn default() -> Self {
        Self::new("localhost")
    }
}

fn to_index(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::invalid_argument(format!("offset too large: {value}")))
}

impl DataManager for MemoryDataManager {
    fn write(&self, entry: &Entry, offset: u64, data: &[u8]) -> Result<()> {
        let offset = to_index(offset)?;
        let mut content = self.blocks.entry(entry.id()).or_default();

        let end = offset + data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, entry: &Entry, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let Some(content) = self.blocks.get(&entry.id()) else {
            return Ok(0);
        };

        let offset = to_index(offset)?;
        let available = to_index(entry.length())?.min(content.len());
        if offset >= available {
            return Ok(0);
        }

        let n = buf.len().min(available - offset);
        buf[..n].copy_from_slice(&content[offset..offset + n]);
        Ok(n)
    }

    fn delete(&self, entry: &Entry) -> Result<()> {
        self.blocks.remove(&entry.id());
        Ok(())
    }

    fn affinity(&self, entry: &Entry, start: u64, len: u64) -> Result<Vec<BlockLocation>> {
        let block_size = u64::from(entry.block_size());
        if block_size == 0 {
            return Err(Error::invalid_argument(format!(
                "entry {} has no block size",
                entry.id()
            )));
        }

        let end = start.saturating_add(len).min(entry.length());
        let mut locations = Vec::new();
        let mut pos = start;

        while pos < end {
            let block_end = (pos / block_size + 1) * block_size;
            let next = block_end.min(end);
            locations.push(BlockLocation {
                start: pos,
                len: next - pos,
                hosts: vec![self.host.clone()],
            });
            pos = next;
        }

        Ok(locations)
    }
}
