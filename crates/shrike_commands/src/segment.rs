//! Segment routing and the per-key lock table.
//!
//! User keys hash onto a fixed set of stores (`crc32(key) % store_count`).
//! Alongside routing, the segment manager hands out per-(db, key)
//! reader/writer locks: reads of the expiration state take the lock shared,
//! TTL rewrites and evictions take it exclusive. Lock waits are bounded;
//! a timeout surfaces as `Busy`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use shrike_common::{ShrikeError, ShrikeResult};
use shrike_storage::KVStore;

use crate::session::Session;

/// How a key lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default, Debug)]
struct SlotState {
    readers: u32,
    writer: bool,
}

#[derive(Debug)]
struct LockSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl LockSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            cond: Condvar::new(),
        }
    }
}

/// RAII key-lock hold; releases and wakes waiters on drop.
#[derive(Debug)]
pub struct KeyLockGuard {
    slot: Arc<LockSlot>,
    mode: LockMode,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        let mut state = self.slot.state.lock();
        match self.mode {
            LockMode::Shared => state.readers -= 1,
            LockMode::Exclusive => state.writer = false,
        }
        drop(state);
        self.slot.cond.notify_all();
    }
}

/// Reader/writer locks keyed by `(db_id, user key)`.
pub struct KeyLockTable {
    slots: DashMap<(u32, Vec<u8>), Arc<LockSlot>>,
    timeout: Duration,
}

impl KeyLockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            timeout,
        }
    }

    pub fn lock(&self, db_id: u32, key: &[u8], mode: LockMode) -> ShrikeResult<KeyLockGuard> {
        let slot = self
            .slots
            .entry((db_id, key.to_vec()))
            .or_insert_with(|| Arc::new(LockSlot::new()))
            .value()
            .clone();

        let deadline = Instant::now() + self.timeout;
        let mut state = slot.state.lock();
        loop {
            let free = match mode {
                LockMode::Shared => !state.writer,
                LockMode::Exclusive => !state.writer && state.readers == 0,
            };
            if free {
                match mode {
                    LockMode::Shared => state.readers += 1,
                    LockMode::Exclusive => state.writer = true,
                }
                break;
            }
            if slot.cond.wait_until(&mut state, deadline).timed_out() {
                return Err(ShrikeError::Busy(format!(
                    "key lock timeout (db {db_id})"
                )));
            }
        }
        drop(state);
        Ok(KeyLockGuard { slot, mode })
    }
}

/// A routed store together with the key lock held for the operation.
pub struct LockedDb {
    pub chunk_id: u32,
    pub store: Arc<KVStore>,
    _guard: KeyLockGuard,
}

/// Routes user keys to stores and serializes per-key access.
pub struct SegmentMgr {
    stores: Vec<Arc<KVStore>>,
    key_locks: KeyLockTable,
}

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

impl SegmentMgr {
    pub fn new(stores: Vec<Arc<KVStore>>) -> Self {
        Self::with_lock_timeout(stores, DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(stores: Vec<Arc<KVStore>>, timeout: Duration) -> Self {
        assert!(!stores.is_empty(), "segment manager needs at least one store");
        Self {
            stores,
            key_locks: KeyLockTable::new(timeout),
        }
    }

    pub fn store_count(&self) -> u32 {
        self.stores.len() as u32
    }

    /// Chunk (and store index) a user key hashes to.
    pub fn chunk_of(&self, key: &[u8]) -> u32 {
        crc32fast::hash(key) % self.store_count()
    }

    /// Resolve `key` to its `(chunk, store)` and take the key lock in `mode`.
    /// The lock is held until the returned handle drops.
    pub fn get_db_with_key_lock(
        &self,
        sess: &Session,
        key: &[u8],
        mode: LockMode,
    ) -> ShrikeResult<LockedDb> {
        let chunk_id = self.chunk_of(key);
        let guard = self.key_locks.lock(sess.ctx.db_id, key, mode)?;
        Ok(LockedDb {
            chunk_id,
            store: self.stores[chunk_id as usize].clone(),
            _guard: guard,
        })
    }

    /// Store backing a chunk. Chunks map one-to-one onto stores.
    pub fn store_for_chunk(&self, chunk_id: u32) -> Option<&Arc<KVStore>> {
        self.stores.get(chunk_id as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> KeyLockTable {
        KeyLockTable::new(Duration::from_millis(20))
    }

    #[test]
    fn test_shared_locks_coexist() {
        let t = table();
        let _a = t.lock(0, b"k", LockMode::Shared).unwrap();
        let _b = t.lock(0, b"k", LockMode::Shared).unwrap();
    }

    #[test]
    fn test_exclusive_excludes_all() {
        let t = table();
        let x = t.lock(0, b"k", LockMode::Exclusive).unwrap();
        assert!(matches!(
            t.lock(0, b"k", LockMode::Shared).unwrap_err(),
            ShrikeError::Busy(_)
        ));
        assert!(matches!(
            t.lock(0, b"k", LockMode::Exclusive).unwrap_err(),
            ShrikeError::Busy(_)
        ));
        drop(x);
        assert!(t.lock(0, b"k", LockMode::Exclusive).is_ok());
    }

    #[test]
    fn test_shared_blocks_exclusive() {
        let t = table();
        let s = t.lock(0, b"k", LockMode::Shared).unwrap();
        assert!(t.lock(0, b"k", LockMode::Exclusive).is_err());
        drop(s);
        assert!(t.lock(0, b"k", LockMode::Exclusive).is_ok());
    }

    #[test]
    fn test_distinct_keys_and_dbs_independent() {
        let t = table();
        let _x = t.lock(0, b"k", LockMode::Exclusive).unwrap();
        assert!(t.lock(0, b"other", LockMode::Exclusive).is_ok());
        assert!(t.lock(1, b"k", LockMode::Exclusive).is_ok());
    }

    #[test]
    fn test_release_wakes_waiter() {
        let t = Arc::new(KeyLockTable::new(Duration::from_secs(5)));
        let x = t.lock(0, b"k", LockMode::Exclusive).unwrap();
        let t2 = t.clone();
        let handle = std::thread::spawn(move || {
            // Blocks until the main thread drops the exclusive hold.
            t2.lock(0, b"k", LockMode::Shared).map(|_| ())
        });
        std::thread::sleep(Duration::from_millis(50));
        drop(x);
        assert!(handle.join().unwrap().is_ok());
    }
}
