//! Entry update descriptors
//!
//! Small serializable deltas applied to an entry through the store's
//! atomic transform. `apply` is a pure function of the old value.

use gridfs_common::{Entry, EntryId, Error, FsPath, ListingEntry, Result};
use serde::{Deserialize, Serialize};

/// Delta applied to a single entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryUpdate {
    /// Add a child reference to a directory listing
    AddListing { name: String, entry: ListingEntry },
    /// Remove the child reference registered under `name`
    RemoveListing { name: String, entry: ListingEntry },
    /// Refresh the cached length and times of a child reference
    ListingEntry {
        file_id: EntryId,
        name: String,
        length_delta: i64,
        access_time: Option<i64>,
        modification_time: Option<i64>,
    },
    /// Record the path an entry had before it was moved to trash
    Path(FsPath),
}

impl EntryUpdate {
    /// Compute the updated entry.
    pub fn apply(&self, entry: &Entry) -> Result<Entry> {
        match self {
            Self::AddListing { name, entry: child } => {
                let mut listing = directory_listing(entry)?.clone();

                if let Some(existing) = listing.get(name)
                    && existing.file_id != child.file_id
                {
                    return Err(Error::inconsistent(format!(
                        "listing of {} already has '{name}' pointing to {} (new {})",
                        entry.id(),
                        existing.file_id,
                        child.file_id
                    )));
                }

                listing.insert(name.clone(), *child);
                Ok(entry.with_listing(listing))
            }
            Self::RemoveListing { name, entry: child } => {
                let mut listing = directory_listing(entry)?.clone();

                match listing.get(name) {
                    Some(existing) if existing.file_id == child.file_id => {
                        listing.remove(name);
                        Ok(entry.with_listing(listing))
                    }
                    Some(existing) => Err(Error::inconsistent(format!(
                        "listing of {} maps '{name}' to {} instead of {}",
                        entry.id(),
                        existing.file_id,
                        child.file_id
                    ))),
                    None => Err(Error::inconsistent(format!(
                        "listing of {} has no '{name}' to remove",
                        entry.id()
                    ))),
                }
            }
            Self::ListingEntry {
                file_id,
                name,
                length_delta,
                access_time,
                modification_time,
            } => {
                let mut listing = directory_listing(entry)?.clone();

                // The child may have been moved or replaced concurrently
                let Some(existing) = listing.get(name).filter(|e| e.file_id == *file_id) else {
                    return Ok(entry.clone());
                };

                let mut updated = existing.with_length_delta(*length_delta);
                if let Some(atime) = access_time {
                    updated.access_time = *atime;
                }
                if let Some(mtime) = modification_time {
                    updated.modification_time = *mtime;
                }

                listing.insert(name.clone(), updated);
                Ok(entry.with_listing(listing))
            }
            Self::Path(path) => Ok(entry.with_path(path.clone())),
        }
    }
}

fn directory_listing(
    entry: &Entry,
) -> Result<&std::collections::BTreeMap<String, ListingEntry>> {
    entry.listing().ok_or_else(|| {
        Error::inconsistent(format!("entry {} is not a directory", entry.id()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridfs_common::Properties;

    fn dir_with(name: &str, child: &Entry) -> Entry {
        let dir = Entry::directory(Properties::new());
        EntryUpdate::AddListing {
            name: name.into(),
            entry: ListingEntry::from(child),
        }
        .apply(&dir)
        .unwrap()
    }

    #[test]
    fn test_add_and_remove_listing() {
        let child = Entry::file(1024, 10, None, Properties::new());
        let dir = dir_with("f", &child);
        assert_eq!(dir.listing_entry("f").unwrap().file_id, child.id());

        let removed = EntryUpdate::RemoveListing {
            name: "f".into(),
            entry: ListingEntry::from(&child),
        }
        .apply(&dir)
        .unwrap();
        assert!(removed.is_empty_directory());
        assert_eq!(removed.id(), dir.id());
    }

    #[test]
    fn test_add_listing_is_repeatable() {
        let child = Entry::file(1024, 10, None, Properties::new());
        let dir = dir_with("f", &child);
        let update = EntryUpdate::AddListing {
            name: "f".into(),
            entry: ListingEntry::from(&child),
        };
        assert_eq!(update.apply(&dir).unwrap(), dir);
    }

    #[test]
    fn test_listing_conflicts_are_inconsistent() {
        let child = Entry::file(1024, 10, None, Properties::new());
        let other = Entry::file(1024, 10, None, Properties::new());
        let dir = dir_with("f", &child);

        let add = EntryUpdate::AddListing {
            name: "f".into(),
            entry: ListingEntry::from(&other),
        };
        assert!(matches!(add.apply(&dir), Err(Error::Inconsistent(_))));

        let remove = EntryUpdate::RemoveListing {
            name: "f".into(),
            entry: ListingEntry::from(&other),
        };
        assert!(matches!(remove.apply(&dir), Err(Error::Inconsistent(_))));

        let file_target = EntryUpdate::AddListing {
            name: "g".into(),
            entry: ListingEntry::from(&other),
        };
        assert!(matches!(file_target.apply(&child), Err(Error::Inconsistent(_))));
    }

    #[test]
    fn test_listing_entry_update() {
        let child = Entry::file(1024, 10, None, Properties::new());
        let dir = dir_with("f", &child);

        let updated = EntryUpdate::ListingEntry {
            file_id: child.id(),
            name: "f".into(),
            length_delta: 90,
            access_time: None,
            modification_time: Some(77),
        }
        .apply(&dir)
        .unwrap();
        let listed = updated.listing_entry("f").unwrap();
        assert_eq!(listed.length, 100);
        assert_eq!(listed.modification_time, 77);
        assert_eq!(listed.access_time, child.access_time());

        let stale = EntryUpdate::ListingEntry {
            file_id: EntryId::random(),
            name: "f".into(),
            length_delta: 1,
            access_time: None,
            modification_time: None,
        };
        assert_eq!(stale.apply(&dir).unwrap(), dir);
    }

    #[test]
    fn test_path_update() {
        let dir = Entry::directory(Properties::new());
        let path = FsPath::new("/a/b").unwrap();
        let updated = EntryUpdate::Path(path.clone()).apply(&dir).unwrap();
        assert_eq!(updated.path(), Some(&path));
    }
}
