//! Shared cache over SST data blocks.
//!
//! One cache instance is allocated per process and handed to every store,
//! so the `block_cache_mb` budget bounds total block memory across stores.
//! Eviction is LRU by access stamp within a byte budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Identity of a cached block: owning SST plus block offset in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub sst_id: u64,
    pub offset: u64,
}

struct CacheSlot {
    data: Arc<Vec<u8>>,
    stamp: u64,
}

#[derive(Default)]
struct CacheInner {
    slots: HashMap<BlockKey, CacheSlot>,
    bytes: usize,
}

/// LRU block cache with a fixed byte budget.
pub struct BlockCache {
    capacity_bytes: usize,
    inner: Mutex<CacheInner>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl BlockCache {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            inner: Mutex::new(CacheInner::default()),
            clock: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a block, refreshing its recency on hit.
    pub fn get(&self, key: &BlockKey) -> Option<Arc<Vec<u8>>> {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(key) {
            Some(slot) => {
                slot.stamp = stamp;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.data.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a block, evicting least-recently-used blocks to stay within
    /// budget. Blocks larger than the whole budget are not cached.
    pub fn insert(&self, key: BlockKey, data: Arc<Vec<u8>>) {
        let size = data.len();
        if size > self.capacity_bytes {
            return;
        }
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        if let Some(old) = inner.slots.insert(key, CacheSlot { data, stamp }) {
            inner.bytes -= old.data.len();
        }
        inner.bytes += size;

        while inner.bytes > self.capacity_bytes {
            let victim = inner
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.stamp)
                .map(|(k, _)| *k);
            match victim {
                Some(k) => {
                    if let Some(slot) = inner.slots.remove(&k) {
                        inner.bytes -= slot.data.len();
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }

    pub fn current_bytes(&self) -> usize {
        self.inner.lock().bytes
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![0u8; n])
    }

    #[test]
    fn test_insert_get() {
        let cache = BlockCache::new(1024);
        let key = BlockKey { sst_id: 1, offset: 0 };
        cache.insert(key, Arc::new(vec![1, 2, 3]));
        assert_eq!(cache.get(&key).unwrap().as_slice(), &[1, 2, 3]);
        assert_eq!(cache.hits(), 1);
        assert!(cache.get(&BlockKey { sst_id: 1, offset: 99 }).is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_eviction_respects_budget() {
        let cache = BlockCache::new(300);
        for i in 0..10 {
            cache.insert(BlockKey { sst_id: i, offset: 0 }, block(100));
        }
        assert!(cache.current_bytes() <= 300);
        assert!(cache.evictions() > 0);
    }

    #[test]
    fn test_lru_keeps_recent() {
        let cache = BlockCache::new(250);
        let a = BlockKey { sst_id: 1, offset: 0 };
        let b = BlockKey { sst_id: 2, offset: 0 };
        cache.insert(a, block(100));
        cache.insert(b, block(100));
        // Touch `a` so `b` becomes the LRU victim.
        cache.get(&a);
        cache.insert(BlockKey { sst_id: 3, offset: 0 }, block(100));
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
    }

    #[test]
    fn test_oversized_block_not_cached() {
        let cache = BlockCache::new(100);
        cache.insert(BlockKey { sst_id: 1, offset: 0 }, block(500));
        assert_eq!(cache.block_count(), 0);
    }

    #[test]
    fn test_reinsert_replaces() {
        let cache = BlockCache::new(1024);
        let key = BlockKey { sst_id: 1, offset: 0 };
        cache.insert(key, block(100));
        cache.insert(key, block(50));
        assert_eq!(cache.block_count(), 1);
        assert_eq!(cache.current_bytes(), 50);
    }
}
