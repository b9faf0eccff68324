//! The session and server-entry surface consumed by command handlers.
//!
//! The network front-end and the command dispatcher live elsewhere; handlers
//! here receive a `Session` carrying the parsed argument vector, the
//! session's selected logical database, and the server entry that owns the
//! segment manager.

use std::path::Path;
use std::sync::Arc;

use shrike_common::config::ShrikeConfig;
use shrike_common::{ShrikeError, ShrikeResult};
use shrike_storage::lsm::{BlockCache, LsmConfig};
use shrike_storage::KVStore;

use crate::segment::SegmentMgr;

/// Per-session command context.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionCtx {
    /// Selected logical database.
    pub db_id: u32,
}

/// Process-wide server state reachable from every session.
pub struct ServerEntry {
    segment_mgr: SegmentMgr,
}

impl ServerEntry {
    /// Open all stores per the configuration. The block cache is allocated
    /// once and shared by every store.
    pub fn open(cfg: &ShrikeConfig) -> ShrikeResult<Arc<Self>> {
        cfg.validate()?;
        let storage = &cfg.storage;

        let cache = Arc::new(BlockCache::new(
            (storage.block_cache_mb as usize) * 1024 * 1024,
        ));
        let engine_config = LsmConfig {
            memtable_budget_bytes: storage.memtable_budget_mb * 1024 * 1024,
            sync_writes: true,
        };
        let db_root = Path::new(&storage.db_path);

        let mut stores = Vec::with_capacity(storage.store_count as usize);
        for store_id in 0..storage.store_count {
            stores.push(Arc::new(KVStore::open(
                store_id.to_string(),
                db_root,
                engine_config.clone(),
                cache.clone(),
            )?));
        }
        tracing::info!(
            stores = storage.store_count,
            db_path = %storage.db_path,
            "server entry opened"
        );
        Ok(Arc::new(Self {
            segment_mgr: SegmentMgr::new(stores),
        }))
    }

    pub fn segment_mgr(&self) -> &SegmentMgr {
        &self.segment_mgr
    }
}

/// One in-flight command invocation.
pub struct Session {
    /// Command arguments, `args[0]` being the command name.
    pub args: Vec<Vec<u8>>,
    pub ctx: SessionCtx,
    server: Arc<ServerEntry>,
}

impl Session {
    pub fn new(server: Arc<ServerEntry>, db_id: u32, args: Vec<Vec<u8>>) -> Self {
        Self {
            args,
            ctx: SessionCtx { db_id },
            server,
        }
    }

    pub fn server(&self) -> &ServerEntry {
        &self.server
    }

    /// Positional argument, or `InvalidArgument` when missing.
    pub fn arg(&self, idx: usize) -> ShrikeResult<&[u8]> {
        self.args
            .get(idx)
            .map(Vec::as_slice)
            .ok_or_else(|| ShrikeError::invalid("wrong number of arguments"))
    }

    /// Positional argument parsed as a signed integer.
    pub fn arg_i64(&self, idx: usize) -> ShrikeResult<i64> {
        let raw = self.arg(idx)?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ShrikeError::invalid("value is not an integer or out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> (tempfile::TempDir, Arc<ServerEntry>) {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = ShrikeConfig::from_toml_str(&format!(
            "[storage]\ndb_path = '{}'\nstore_count = 2\nblock_cache_mb = 4\n",
            dir.path().display()
        ))
        .unwrap();
        let server = ServerEntry::open(&cfg).unwrap();
        (dir, server)
    }

    #[test]
    fn test_open_creates_stores() {
        let (_dir, server) = test_server();
        assert_eq!(server.segment_mgr().store_count(), 2);
    }

    #[test]
    fn test_arg_helpers() {
        let (_dir, server) = test_server();
        let sess = Session::new(
            server.clone(),
            0,
            vec![b"expire".to_vec(), b"key".to_vec(), b"-12".to_vec()],
        );
        assert_eq!(sess.arg(1).unwrap(), b"key");
        assert_eq!(sess.arg_i64(2).unwrap(), -12);
        assert!(sess.arg(3).is_err());

        let bad = Session::new(
            server,
            0,
            vec![b"expire".to_vec(), b"key".to_vec(), b"abc".to_vec()],
        );
        assert!(bad.arg_i64(2).is_err());
    }
}
