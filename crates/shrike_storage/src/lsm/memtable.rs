//! Multi-versioned sorted write buffer.
//!
//! Committed batches land here first. Each key holds a chain of versions,
//! newest first; a reader at snapshot `s` sees the newest version with
//! `seq <= s`. Tombstones are versions with no data. The whole buffer is
//! drained to an SST file on flush, versions included, so snapshots taken
//! before the flush keep reading consistently from the file.

use std::collections::BTreeMap;
use std::ops::Bound;

/// One committed version of a key. `data == None` is a tombstone.
#[derive(Debug, Clone)]
pub struct Version {
    pub seq: u64,
    pub data: Option<Vec<u8>>,
}

/// Sorted in-memory buffer of version chains.
#[derive(Debug, Default)]
pub struct MemTable {
    /// key → versions, newest first.
    map: BTreeMap<Vec<u8>, Vec<Version>>,
    approx_bytes: u64,
    version_count: u64,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new version for `key`. `seq` must exceed every sequence
    /// already present for the key.
    pub fn apply(&mut self, key: &[u8], seq: u64, data: Option<&[u8]>) {
        let entry_bytes = key.len() + data.map(<[u8]>::len).unwrap_or(0) + 16;
        let versions = self.map.entry(key.to_vec()).or_default();
        debug_assert!(versions.first().map(|v| v.seq < seq).unwrap_or(true));
        versions.insert(
            0,
            Version {
                seq,
                data: data.map(<[u8]>::to_vec),
            },
        );
        self.approx_bytes += entry_bytes as u64;
        self.version_count += 1;
    }

    /// Newest version of `key` with `seq <= snapshot`, if any.
    pub fn visible(&self, key: &[u8], snapshot: u64) -> Option<&Version> {
        self.map
            .get(key)?
            .iter()
            .find(|v| v.seq <= snapshot)
    }

    /// Sequence of the newest version of `key`, regardless of snapshot.
    pub fn latest_seq(&self, key: &[u8]) -> Option<u64> {
        self.map.get(key).and_then(|v| v.first()).map(|v| v.seq)
    }

    /// Iterate version chains for keys `>= start`, in key order.
    pub fn range_from<'a>(
        &'a self,
        start: &[u8],
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<Version>)> {
        self.map
            .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
    }

    /// Drain every version in (key asc, seq desc) order for flushing.
    pub fn into_sorted_versions(self) -> impl Iterator<Item = (Vec<u8>, Vec<Version>)> {
        self.map.into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes
    }

    pub fn version_count(&self) -> u64 {
        self.version_count
    }
}
