//! The ordered KV primitive: versioned batches over memtable + SST files.
//!
//! Commits are serialized by an apply lock and stamped with a monotonically
//! increasing sequence. `commit_batch` performs the optimistic conflict
//! check — any key written since the caller's snapshot fails the batch —
//! atomically with the apply, which is the engine-side half of the
//! transaction contract.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use shrike_common::{ShrikeError, ShrikeResult};

use super::block_cache::BlockCache;
use super::memtable::MemTable;
use super::sst::{SstReader, SstWriter};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Memtable bytes before an automatic flush. 0 disables auto-flush.
    pub memtable_budget_bytes: u64,
    /// Fsync SST files on flush.
    pub sync_writes: bool,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            memtable_budget_bytes: 64 * 1024 * 1024,
            sync_writes: true,
        }
    }
}

pub struct LsmEngine {
    config: LsmConfig,
    data_dir: PathBuf,
    cache: Arc<BlockCache>,

    /// Active write buffer.
    active: RwLock<MemTable>,
    /// Buffer currently being written to an SST; still readable.
    flushing: RwLock<Option<MemTable>>,
    /// Immutable files, newest first.
    tables: RwLock<Vec<SstReader>>,

    /// Sequence of the newest committed batch.
    committed_seq: AtomicU64,
    next_file_seq: AtomicU64,

    /// Serializes conflict check + apply.
    apply_lock: Mutex<()>,
    /// Serializes flushes.
    flush_lock: Mutex<()>,
}

impl LsmEngine {
    /// Open or create an engine at `data_dir`, recovering the file set and
    /// the committed-sequence watermark from SST footers.
    pub fn open(data_dir: &Path, config: LsmConfig, cache: Arc<BlockCache>) -> ShrikeResult<Self> {
        fs::create_dir_all(data_dir)?;

        let mut tables = Vec::new();
        for entry in fs::read_dir(data_dir)? {
            let path = entry?.path();
            let Some(file_seq) = parse_file_seq(&path) else {
                continue;
            };
            match SstReader::open(&path, file_seq, cache.clone()) {
                Ok(reader) => tables.push(reader),
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "skipping unreadable sst file");
                }
            }
        }
        tables.sort_by(|a, b| b.meta().file_seq.cmp(&a.meta().file_seq));

        let committed_seq = tables.iter().map(|t| t.meta().max_seq).max().unwrap_or(0);
        let next_file_seq = tables.iter().map(|t| t.meta().file_seq).max().unwrap_or(0) + 1;

        Ok(Self {
            config,
            data_dir: data_dir.to_path_buf(),
            cache,
            active: RwLock::new(MemTable::new()),
            flushing: RwLock::new(None),
            tables: RwLock::new(tables),
            committed_seq: AtomicU64::new(committed_seq),
            next_file_seq: AtomicU64::new(next_file_seq),
            apply_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
        })
    }

    /// Sequence visible to a transaction opened now.
    pub fn snapshot(&self) -> u64 {
        self.committed_seq.load(Ordering::Acquire)
    }

    /// Commit a batch read at `snapshot`. Fails with `CommitRetry` iff any
    /// key in the batch carries a committed version newer than the snapshot.
    pub fn commit_batch(
        &self,
        snapshot: u64,
        batch: &BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) -> ShrikeResult<u64> {
        let guard = self.apply_lock.lock();

        for key in batch.keys() {
            if let Some(seq) = self.latest_seq(key)? {
                if seq > snapshot {
                    return Err(ShrikeError::CommitRetry);
                }
            }
        }

        let seq = self.committed_seq.load(Ordering::Acquire) + 1;
        {
            let mut active = self.active.write();
            for (key, data) in batch {
                active.apply(key, seq, data.as_deref());
            }
        }
        self.committed_seq.store(seq, Ordering::Release);
        drop(guard);

        let budget = self.config.memtable_budget_bytes;
        if budget > 0 && self.active.read().approx_bytes() >= budget {
            self.flush()?;
        }
        Ok(seq)
    }

    /// Point read at a snapshot. `None` for absent keys and tombstones.
    pub fn get_at(&self, key: &[u8], snapshot: u64) -> ShrikeResult<Option<Vec<u8>>> {
        if let Some(v) = self.active.read().visible(key, snapshot) {
            return Ok(v.data.clone());
        }
        if let Some(mt) = self.flushing.read().as_ref() {
            if let Some(v) = mt.visible(key, snapshot) {
                return Ok(v.data.clone());
            }
        }
        for t in self.tables.read().iter() {
            if !t.meta().may_contain(key) {
                continue;
            }
            if let Some(v) = t.get_visible(key, snapshot)? {
                return Ok(if v.tombstone { None } else { Some(v.value) });
            }
        }
        Ok(None)
    }

    /// Sequence of the newest committed version of `key`, if any.
    pub fn latest_seq(&self, key: &[u8]) -> ShrikeResult<Option<u64>> {
        if let Some(seq) = self.active.read().latest_seq(key) {
            return Ok(Some(seq));
        }
        if let Some(mt) = self.flushing.read().as_ref() {
            if let Some(seq) = mt.latest_seq(key) {
                return Ok(Some(seq));
            }
        }
        for t in self.tables.read().iter() {
            if !t.meta().may_contain(key) {
                continue;
            }
            if let Some(seq) = t.latest_seq(key)? {
                return Ok(Some(seq));
            }
        }
        Ok(None)
    }

    /// Ordered live entries with `key >= start` at a snapshot, tombstones
    /// resolved.
    pub fn scan_from(
        &self,
        snapshot: u64,
        start: &[u8],
    ) -> ShrikeResult<Vec<(Vec<u8>, Vec<u8>)>> {
        // key → (seq, data); the newest visible version per key wins.
        let mut acc: BTreeMap<Vec<u8>, (u64, Option<Vec<u8>>)> = BTreeMap::new();
        let offer = |acc: &mut BTreeMap<Vec<u8>, (u64, Option<Vec<u8>>)>,
                         key: &[u8],
                         seq: u64,
                         data: Option<Vec<u8>>| {
            match acc.get(key) {
                Some(&(have, _)) if have >= seq => {}
                _ => {
                    acc.insert(key.to_vec(), (seq, data));
                }
            }
        };

        {
            let active = self.active.read();
            for (key, versions) in active.range_from(start) {
                if let Some(v) = versions.iter().find(|v| v.seq <= snapshot) {
                    offer(&mut acc, key, v.seq, v.data.clone());
                }
            }
        }
        if let Some(mt) = self.flushing.read().as_ref() {
            for (key, versions) in mt.range_from(start) {
                if let Some(v) = versions.iter().find(|v| v.seq <= snapshot) {
                    offer(&mut acc, key, v.seq, v.data.clone());
                }
            }
        }
        for t in self.tables.read().iter() {
            for v in t.scan_from(start)? {
                if v.seq <= snapshot {
                    let data = if v.tombstone { None } else { Some(v.value) };
                    offer(&mut acc, &v.key, v.seq, data);
                }
            }
        }

        Ok(acc
            .into_iter()
            .filter_map(|(k, (_, data))| data.map(|d| (k, d)))
            .collect())
    }

    /// Write the memtable out as a new L0 SST file.
    pub fn flush(&self) -> ShrikeResult<()> {
        let _fg = self.flush_lock.lock();

        // A previously failed flush leaves its buffer behind; finish it
        // before swapping in a new one.
        if self.flushing.read().is_some() {
            self.write_flushing()?;
        }

        {
            let mut active = self.active.write();
            if active.is_empty() {
                return Ok(());
            }
            let mut flushing = self.flushing.write();
            *flushing = Some(std::mem::take(&mut *active));
        }
        self.write_flushing()
    }

    /// Immutable file set `(name, size, path)`, newest first. Every listed
    /// file is complete on disk.
    pub fn files(&self) -> Vec<(String, u64, PathBuf)> {
        self.tables
            .read()
            .iter()
            .map(|t| {
                let m = t.meta();
                let name = m
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (name, m.file_size, m.path.clone())
            })
            .collect()
    }

    /// Flush pending data before the engine is dropped.
    pub fn shutdown(&self) -> ShrikeResult<()> {
        self.flush()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn write_flushing(&self) -> ShrikeResult<()> {
        let file_seq = self.next_file_seq.fetch_add(1, Ordering::Relaxed);
        let path = self.data_dir.join(format!("L0_{file_seq:08}.sst"));

        let version_count;
        {
            let flushing = self.flushing.read();
            let Some(mt) = flushing.as_ref() else {
                return Ok(());
            };
            version_count = mt.version_count();
            let mut writer = SstWriter::create(&path)?;
            for (key, versions) in mt.range_from(&[]) {
                for v in versions {
                    match &v.data {
                        Some(data) => writer.add(key, v.seq, false, data)?,
                        None => writer.add(key, v.seq, true, b"")?,
                    }
                }
            }
            writer.finish(file_seq, self.config.sync_writes)?;
        }

        let reader = SstReader::open(&path, file_seq, self.cache.clone())?;
        {
            let mut flushing = self.flushing.write();
            self.tables.write().insert(0, reader);
            *flushing = None;
        }
        tracing::debug!(
            file = %path.display(),
            versions = version_count,
            "memtable flushed to L0"
        );
        Ok(())
    }
}

fn parse_file_seq(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some("sst") {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("L0_")?
        .parse()
        .ok()
}
