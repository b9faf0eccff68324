//! Transactions over one store's engine.
//!
//! A transaction is exclusively owned by its handler. Writes are buffered in
//! the write set and become visible to other transactions only at commit;
//! conflict detection is optimistic, at commit time. The store keeps just
//! the transaction id in its uncommitted set — dropping the handle rolls
//! back and deregisters.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use shrike_common::{ShrikeResult, TxnId};

use crate::store::StoreCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

pub struct Transaction {
    id: TxnId,
    snapshot: u64,
    /// Pending writes; `None` is a pending delete.
    write_set: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    state: TxnState,
    core: Arc<StoreCore>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot)
            .field("state", &self.state)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn begin(core: Arc<StoreCore>) -> Self {
        let id = core.register_txn();
        let snapshot = core.engine.snapshot();
        Self {
            id,
            snapshot,
            write_set: BTreeMap::new(),
            state: TxnState::Active,
            core,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Committed sequence this transaction reads at.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    /// Read a key: own pending writes first, then the snapshot.
    pub fn get(&self, key: &[u8]) -> ShrikeResult<Option<Vec<u8>>> {
        if let Some(pending) = self.write_set.get(key) {
            return Ok(pending.clone());
        }
        self.core.engine.get_at(key, self.snapshot)
    }

    /// Buffer a write; visible only to this transaction until commit.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.write_set.insert(key, Some(value));
    }

    /// Buffer a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.write_set.insert(key, None);
    }

    /// Forward cursor over the keyspace at this transaction's snapshot,
    /// overlaid with its own pending writes.
    pub fn cursor(&self) -> ShrikeResult<Cursor<'_>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .core
            .engine
            .scan_from(self.snapshot, &[])?
            .into_iter()
            .collect();
        for (key, pending) in &self.write_set {
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(Cursor {
            entries: merged.into_iter().collect(),
            pos: 0,
            _txn: PhantomData,
        })
    }

    /// Commit the write set. On `CommitRetry` the transaction is closed; the
    /// caller must open a fresh one and reapply its work.
    pub fn commit(mut self) -> ShrikeResult<u64> {
        let batch = std::mem::take(&mut self.write_set);
        match self.core.engine.commit_batch(self.snapshot, &batch) {
            Ok(seq) => {
                self.finish(TxnState::Committed);
                Ok(seq)
            }
            Err(e) => {
                self.finish(TxnState::RolledBack);
                Err(e)
            }
        }
    }

    /// Discard the write set and deregister.
    pub fn rollback(mut self) {
        self.finish(TxnState::RolledBack);
    }

    fn finish(&mut self, state: TxnState) {
        if self.state == TxnState::Active {
            self.core.deregister_txn(self.id);
            self.state = state;
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            tracing::trace!(txn = %self.id, "transaction dropped while active, rolling back");
            self.finish(TxnState::RolledBack);
        }
    }
}

/// Forward-only iterator over the encoded keyspace at a transaction's
/// snapshot. Reflects the transaction's uncommitted writes as of cursor
/// creation.
pub struct Cursor<'a> {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
    _txn: PhantomData<&'a Transaction>,
}

impl Cursor<'_> {
    /// Position at the smallest key `>= prefix`.
    pub fn seek(&mut self, prefix: &[u8]) {
        self.pos = self
            .entries
            .partition_point(|(k, _)| k.as_slice() < prefix);
    }

    /// The next `(key, value)` pair, or `None` when exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let item = self.entries.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsm::{BlockCache, LsmConfig};
    use crate::store::KVStore;
    use tempfile::TempDir;

    fn test_store(dir: &std::path::Path) -> KVStore {
        KVStore::open(
            "0",
            dir,
            LsmConfig {
                memtable_budget_bytes: 0,
                sync_writes: false,
            },
            Arc::new(BlockCache::new(1 << 20)),
        )
        .unwrap()
    }

    #[test]
    fn test_read_your_writes() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());
        let mut txn = store.create_transaction().unwrap();

        assert_eq!(txn.get(b"k").unwrap(), None);
        txn.set(b"k".to_vec(), b"v".to_vec());
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v".to_vec()));
        txn.delete(b"k".to_vec());
        assert_eq!(txn.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_buffered_writes_invisible_to_others() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());

        let mut t1 = store.create_transaction().unwrap();
        t1.set(b"k".to_vec(), b"v".to_vec());

        let t2 = store.create_transaction().unwrap();
        assert_eq!(t2.get(b"k").unwrap(), None);

        t1.commit().unwrap();
        // t2 reads at its snapshot, which predates the commit.
        assert_eq!(t2.get(b"k").unwrap(), None);

        let t3 = store.create_transaction().unwrap();
        assert_eq!(t3.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_cursor_sees_own_writes() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());

        let mut seeder = store.create_transaction().unwrap();
        seeder.set(b"a".to_vec(), b"1".to_vec());
        seeder.set(b"b".to_vec(), b"2".to_vec());
        seeder.commit().unwrap();

        let mut txn = store.create_transaction().unwrap();
        txn.set(b"c".to_vec(), b"3".to_vec());
        txn.delete(b"a".to_vec());

        let mut cur = txn.cursor().unwrap();
        let mut seen = Vec::new();
        while let Some((k, _)) = cur.next() {
            seen.push(k);
        }
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_cursor_seek() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());

        let mut seeder = store.create_transaction().unwrap();
        for key in [&b"a"[..], b"ab", b"b", b"ba"] {
            seeder.set(key.to_vec(), b"v".to_vec());
        }
        seeder.commit().unwrap();

        let txn = store.create_transaction().unwrap();
        let mut cur = txn.cursor().unwrap();
        cur.seek(b"b");
        assert_eq!(cur.next().unwrap().0, b"b".to_vec());
        assert_eq!(cur.next().unwrap().0, b"ba".to_vec());
        assert!(cur.next().is_none());

        // Seeking back rewinds the cursor.
        cur.seek(b"a");
        assert_eq!(cur.next().unwrap().0, b"a".to_vec());
    }

    #[test]
    fn test_rollback_discards() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());

        let mut txn = store.create_transaction().unwrap();
        txn.set(b"k".to_vec(), b"v".to_vec());
        txn.rollback();

        let txn = store.create_transaction().unwrap();
        assert_eq!(txn.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_drop_deregisters() {
        let dir = TempDir::new().unwrap();
        let store = test_store(dir.path());

        let txn = store.create_transaction().unwrap();
        let id = txn.id();
        assert!(store.uncommitted_txns().contains(&id));
        drop(txn);
        assert!(!store.uncommitted_txns().contains(&id));
    }
}
