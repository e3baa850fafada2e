//! Redb table definitions for persistent entry storage.

use redb::TableDefinition;

// Key: entry ID (hyphenated UUID), Value: bincode-encoded Entry
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
