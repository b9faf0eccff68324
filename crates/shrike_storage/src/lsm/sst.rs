//! Sorted-run (SST) file format.
//!
//! An SST holds every version the memtable carried at flush time, sorted by
//! (key asc, seq desc). Files are immutable once written; newer files shadow
//! older ones on the read path.
//!
//! ```text
//!   [Block 0] [Block 1] ... [Index] [Footer]
//!
//!   Block : [count: u32][entry*][crc32: u32]
//!   Entry : [key_len: u32][val_len: u32][seq: u64][flags: u8][key][val]
//!           flags bit 0 = tombstone (val empty)
//!   Index : [count: u32] ([offset: u64][len: u32][last_key_len: u32][last_key])*
//!   Footer: magic "SKT1" | version: u32 | index_offset: u64 | index_len: u64
//!           | entry_count: u64 | max_seq: u64 | crc32: u32        (44 bytes)
//! ```
//!
//! `max_seq` in the footer lets the engine recover its committed-sequence
//! watermark after a restart. All integers are little-endian.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shrike_common::{ShrikeError, ShrikeResult};

use super::block_cache::{BlockCache, BlockKey};

const SST_MAGIC: &[u8; 4] = b"SKT1";
const SST_FORMAT_VERSION: u32 = 1;
const FOOTER_SIZE: usize = 44;
const ENTRY_HDR_LEN: usize = 4 + 4 + 8 + 1;
const TARGET_BLOCK_SIZE: usize = 4096;

const FLAG_TOMBSTONE: u8 = 0x01;

/// Process-unique ids keying the shared block cache.
static NEXT_SST_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory description of one SST file.
#[derive(Debug, Clone)]
pub struct SstMeta {
    /// Block-cache identity, unique per opened file.
    pub id: u64,
    pub path: PathBuf,
    /// Flush ordinal parsed from the file name; newer files shadow older.
    pub file_seq: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub entry_count: u64,
    /// Highest commit sequence stored in this file.
    pub max_seq: u64,
    pub file_size: u64,
}

impl SstMeta {
    pub fn may_contain(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }
}

/// One stored version.
#[derive(Debug, Clone)]
pub struct SstVersion {
    pub key: Vec<u8>,
    pub seq: u64,
    pub tombstone: bool,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    last_key: Vec<u8>,
    offset: u64,
    len: u32,
}

// ── Writer ──────────────────────────────────────────────────────────────────

/// Streams sorted versions into a new SST file.
pub struct SstWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    index: Vec<IndexEntry>,
    block_buf: Vec<u8>,
    block_entries: u32,
    offset: u64,
    entry_count: u64,
    max_seq: u64,
    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl SstWriter {
    pub fn create(path: &Path) -> ShrikeResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::with_capacity(64 * 1024, file),
            path: path.to_path_buf(),
            index: Vec::new(),
            block_buf: Vec::with_capacity(TARGET_BLOCK_SIZE),
            block_entries: 0,
            offset: 0,
            entry_count: 0,
            max_seq: 0,
            first_key: None,
            last_key: None,
        })
    }

    /// Append a version. Callers must feed versions in (key asc, seq desc)
    /// order.
    pub fn add(&mut self, key: &[u8], seq: u64, tombstone: bool, value: &[u8]) -> ShrikeResult<()> {
        if self.first_key.is_none() {
            self.first_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());
        self.max_seq = self.max_seq.max(seq);

        self.block_buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.block_buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.block_buf.extend_from_slice(&seq.to_le_bytes());
        self.block_buf.push(if tombstone { FLAG_TOMBSTONE } else { 0 });
        self.block_buf.extend_from_slice(key);
        self.block_buf.extend_from_slice(value);
        self.block_entries += 1;
        self.entry_count += 1;

        if self.block_buf.len() >= TARGET_BLOCK_SIZE {
            self.finish_block()?;
        }
        Ok(())
    }

    /// Write index and footer. Returns the metadata of the finished file.
    pub fn finish(mut self, file_seq: u64, sync: bool) -> ShrikeResult<SstMeta> {
        if !self.block_buf.is_empty() {
            self.finish_block()?;
        }

        let index_offset = self.offset;
        let index_data = self.encode_index();
        self.writer.write_all(&index_data)?;
        self.offset += index_data.len() as u64;

        let mut footer = [0u8; FOOTER_SIZE];
        footer[0..4].copy_from_slice(SST_MAGIC);
        footer[4..8].copy_from_slice(&SST_FORMAT_VERSION.to_le_bytes());
        footer[8..16].copy_from_slice(&index_offset.to_le_bytes());
        footer[16..24].copy_from_slice(&(index_data.len() as u64).to_le_bytes());
        footer[24..32].copy_from_slice(&self.entry_count.to_le_bytes());
        footer[32..40].copy_from_slice(&self.max_seq.to_le_bytes());
        let crc = crc32fast::hash(&footer[0..40]);
        footer[40..44].copy_from_slice(&crc.to_le_bytes());
        self.writer.write_all(&footer)?;
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_all()?;
        }

        Ok(SstMeta {
            id: NEXT_SST_ID.fetch_add(1, Ordering::Relaxed),
            path: self.path,
            file_seq,
            min_key: self.first_key.unwrap_or_default(),
            max_key: self.last_key.unwrap_or_default(),
            entry_count: self.entry_count,
            max_seq: self.max_seq,
            file_size: self.offset + FOOTER_SIZE as u64,
        })
    }

    fn finish_block(&mut self) -> ShrikeResult<()> {
        let header = self.block_entries.to_le_bytes();
        let mut crc = crc32fast::Hasher::new();
        crc.update(&header);
        crc.update(&self.block_buf);

        let offset = self.offset;
        self.writer.write_all(&header)?;
        self.writer.write_all(&self.block_buf)?;
        self.writer.write_all(&crc.finalize().to_le_bytes())?;
        let len = (4 + self.block_buf.len() + 4) as u32;
        self.offset += len as u64;

        self.index.push(IndexEntry {
            last_key: self.last_key.clone().unwrap_or_default(),
            offset,
            len,
        });
        self.block_buf.clear();
        self.block_entries = 0;
        Ok(())
    }

    fn encode_index(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for e in &self.index {
            buf.extend_from_slice(&e.offset.to_le_bytes());
            buf.extend_from_slice(&e.len.to_le_bytes());
            buf.extend_from_slice(&(e.last_key.len() as u32).to_le_bytes());
            buf.extend_from_slice(&e.last_key);
        }
        buf
    }
}

// ── Reader ──────────────────────────────────────────────────────────────────

/// Reads an SST for point lookups and range scans, going through the shared
/// block cache.
pub struct SstReader {
    meta: SstMeta,
    index: Vec<IndexEntry>,
    cache: Arc<BlockCache>,
}

impl SstReader {
    /// Open a file, validating footer and index.
    pub fn open(path: &Path, file_seq: u64, cache: Arc<BlockCache>) -> ShrikeResult<Self> {
        let file_size = fs::metadata(path)?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(ShrikeError::codec(format!(
                "sst {}: file too small for footer",
                path.display()
            )));
        }

        let mut file = File::open(path)?;
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        if &footer[0..4] != SST_MAGIC {
            return Err(ShrikeError::codec(format!(
                "sst {}: bad magic",
                path.display()
            )));
        }
        let stored_crc = u32::from_le_bytes(footer[40..44].try_into().unwrap());
        let actual_crc = crc32fast::hash(&footer[0..40]);
        if stored_crc != actual_crc {
            return Err(ShrikeError::codec(format!(
                "sst {}: footer checksum mismatch",
                path.display()
            )));
        }
        let version = u32::from_le_bytes(footer[4..8].try_into().unwrap());
        if version != SST_FORMAT_VERSION {
            return Err(ShrikeError::codec(format!(
                "sst {}: unsupported format version {version}",
                path.display()
            )));
        }

        let index_offset = u64::from_le_bytes(footer[8..16].try_into().unwrap());
        let index_len = u64::from_le_bytes(footer[16..24].try_into().unwrap());
        let entry_count = u64::from_le_bytes(footer[24..32].try_into().unwrap());
        let max_seq = u64::from_le_bytes(footer[32..40].try_into().unwrap());
        if index_offset + index_len > file_size - FOOTER_SIZE as u64 {
            return Err(ShrikeError::codec(format!(
                "sst {}: index extends beyond file",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact(&mut index_buf)?;
        let index = parse_index(&index_buf)
            .ok_or_else(|| ShrikeError::codec(format!("sst {}: bad index", path.display())))?;

        let mut reader = Self {
            meta: SstMeta {
                id: NEXT_SST_ID.fetch_add(1, Ordering::Relaxed),
                path: path.to_path_buf(),
                file_seq,
                min_key: Vec::new(),
                max_key: index.last().map(|e| e.last_key.clone()).unwrap_or_default(),
                entry_count,
                max_seq,
                file_size,
            },
            index,
            cache,
        };
        if let Some(first) = reader.index.first().cloned() {
            let versions = reader.decode_block_at(&first)?;
            reader.meta.min_key = versions.first().map(|v| v.key.clone()).unwrap_or_default();
        }
        Ok(reader)
    }

    pub fn meta(&self) -> &SstMeta {
        &self.meta
    }

    /// Newest version of `key` with `seq <= snapshot`, if this file holds one.
    pub fn get_visible(&self, key: &[u8], snapshot: u64) -> ShrikeResult<Option<SstVersion>> {
        let mut idx = self.candidate_block(key);
        while idx < self.index.len() {
            let block = self.index[idx].clone();
            for v in self.decode_block_at(&block)? {
                if v.key.as_slice() > key {
                    return Ok(None);
                }
                if v.key == key && v.seq <= snapshot {
                    return Ok(Some(v));
                }
            }
            // The key's versions may continue into the next block.
            idx += 1;
        }
        Ok(None)
    }

    /// Sequence of the newest stored version of `key`.
    pub fn latest_seq(&self, key: &[u8]) -> ShrikeResult<Option<u64>> {
        let mut idx = self.candidate_block(key);
        while idx < self.index.len() {
            let block = self.index[idx].clone();
            for v in self.decode_block_at(&block)? {
                if v.key.as_slice() > key {
                    return Ok(None);
                }
                if v.key == key {
                    return Ok(Some(v.seq));
                }
            }
            idx += 1;
        }
        Ok(None)
    }

    /// Every stored version with `key >= start`, in file order.
    pub fn scan_from(&self, start: &[u8]) -> ShrikeResult<Vec<SstVersion>> {
        let mut out = Vec::new();
        for idx in self.candidate_block(start)..self.index.len() {
            let block = self.index[idx].clone();
            for v in self.decode_block_at(&block)? {
                if v.key.as_slice() >= start {
                    out.push(v);
                }
            }
        }
        Ok(out)
    }

    fn candidate_block(&self, key: &[u8]) -> usize {
        self.index.partition_point(|e| e.last_key.as_slice() < key)
    }

    fn decode_block_at(&self, entry: &IndexEntry) -> ShrikeResult<Vec<SstVersion>> {
        let cache_key = BlockKey {
            sst_id: self.meta.id,
            offset: entry.offset,
        };
        let raw = match self.cache.get(&cache_key) {
            Some(raw) => raw,
            None => {
                let raw = Arc::new(self.read_block(entry)?);
                self.cache.insert(cache_key, raw.clone());
                raw
            }
        };
        decode_block(&raw).ok_or_else(|| {
            ShrikeError::codec(format!(
                "sst {}: malformed block at offset {}",
                self.meta.path.display(),
                entry.offset
            ))
        })
    }

    fn read_block(&self, entry: &IndexEntry) -> ShrikeResult<Vec<u8>> {
        let mut file = File::open(&self.meta.path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut buf = vec![0u8; entry.len as usize];
        file.read_exact(&mut buf)?;
        if buf.len() < 8 {
            return Err(ShrikeError::codec(format!(
                "sst {}: truncated block",
                self.meta.path.display()
            )));
        }
        let body_len = buf.len() - 4;
        let stored_crc = u32::from_le_bytes(buf[body_len..].try_into().unwrap());
        let actual_crc = crc32fast::hash(&buf[..body_len]);
        if stored_crc != actual_crc {
            return Err(ShrikeError::codec(format!(
                "sst {}: block checksum mismatch at offset {}",
                self.meta.path.display(),
                entry.offset
            )));
        }
        buf.truncate(body_len);
        Ok(buf)
    }
}

fn parse_index(raw: &[u8]) -> Option<Vec<IndexEntry>> {
    let count = u32::from_le_bytes(raw.get(0..4)?.try_into().ok()?) as usize;
    let mut out = Vec::with_capacity(count);
    let mut i = 4;
    for _ in 0..count {
        let offset = u64::from_le_bytes(raw.get(i..i + 8)?.try_into().ok()?);
        let len = u32::from_le_bytes(raw.get(i + 8..i + 12)?.try_into().ok()?);
        let key_len = u32::from_le_bytes(raw.get(i + 12..i + 16)?.try_into().ok()?) as usize;
        let last_key = raw.get(i + 16..i + 16 + key_len)?.to_vec();
        i += 16 + key_len;
        out.push(IndexEntry {
            last_key,
            offset,
            len,
        });
    }
    if i != raw.len() {
        return None;
    }
    Some(out)
}

/// Decode a checksum-stripped block body into versions.
fn decode_block(raw: &[u8]) -> Option<Vec<SstVersion>> {
    let count = u32::from_le_bytes(raw.get(0..4)?.try_into().ok()?) as usize;
    let mut out = Vec::with_capacity(count);
    let mut i = 4;
    for _ in 0..count {
        let key_len = u32::from_le_bytes(raw.get(i..i + 4)?.try_into().ok()?) as usize;
        let val_len = u32::from_le_bytes(raw.get(i + 4..i + 8)?.try_into().ok()?) as usize;
        let seq = u64::from_le_bytes(raw.get(i + 8..i + 16)?.try_into().ok()?);
        let flags = *raw.get(i + 16)?;
        i += ENTRY_HDR_LEN;
        let key = raw.get(i..i + key_len)?.to_vec();
        i += key_len;
        let value = raw.get(i..i + val_len)?.to_vec();
        i += val_len;
        out.push(SstVersion {
            key,
            seq,
            tombstone: flags & FLAG_TOMBSTONE != 0,
            value,
        });
    }
    if i != raw.len() {
        return None;
    }
    Some(out)
}
