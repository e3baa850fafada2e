//! Per-key pessimistic locks held by transactions.

use gridfs_common::{EntryId, Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Transaction identifier
pub type TxId = u64;

/// Owner table of the key locks
#[derive(Default)]
pub struct LockTable {
    owners: Mutex<HashMap<EntryId, TxId>>,
    released: Condvar,
}

impl LockTable {
    /// Acquire the lock on `id` for `tx`, waiting at most `timeout`.
    ///
    /// Returns `true` when the lock was newly taken and `false` when `tx`
    /// already owned it.
    pub fn acquire(&self, id: EntryId, tx: TxId, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut owners = self.owners.lock();

        loop {
            match owners.get(&id) {
                None => {
                    owners.insert(id, tx);
                    return Ok(true);
                }
                Some(owner) if *owner == tx => return Ok(false),
                Some(_) => {
                    if self.released.wait_until(&mut owners, deadline).timed_out()
                        && owners.get(&id).is_some_and(|owner| *owner != tx)
                    {
                        return Err(Error::TxTimeout(format!(
                            "tx {tx} waited {timeout:?} for entry {id}"
                        )));
                    }
                }
            }
        }
    }

    /// Release every lock in `ids` owned by `tx`.
    pub fn release_all(&self, tx: TxId, ids: &[EntryId]) {
        if ids.is_empty() {
            return;
        }

        let mut owners = self.owners.lock();
        for id in ids {
            if owners.get(id) == Some(&tx) {
                owners.remove(id);
            }
        }
        drop(owners);

        self.released.notify_all();
    }

    /// Owner of the lock on `id`
    pub fn owner(&self, id: EntryId) -> Option<TxId> {
        self.owners.lock().get(&id).copied()
    }
}
