//! One KVStore per storage segment.
//!
//! A store owns one LSM engine instance, hands out transactions, tracks the
//! ids of transactions still in flight, and runs the lifecycle state
//! machine:
//!
//! ```text
//!   Running → Paused → (Running | Cleared) → Running
//! ```
//!
//! `stop` refuses while any transaction is registered — that protection
//! forces callers to drop their handles before the engine goes away.
//! Backups copy the flushed, immutable file set; at most one backup is
//! outstanding per store until the next restart.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use shrike_common::{ShrikeError, ShrikeResult, TxnId};

use crate::lsm::{BlockCache, LsmConfig, LsmEngine};
use crate::record::{RecordKey, RecordValue};
use crate::txn::Transaction;

/// Snapshot description returned by [`KVStore::backup`].
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// `(file name, size in bytes)` of every file in the backup.
    pub file_list: Vec<(String, u64)>,
}

/// The running half of a store: engine plus transaction bookkeeping.
/// Transactions hold an `Arc` to this; the store drops its own reference
/// when paused.
pub(crate) struct StoreCore {
    pub(crate) engine: LsmEngine,
    next_txn_id: AtomicU64,
    uncommitted: Mutex<BTreeSet<TxnId>>,
}

impl StoreCore {
    fn open(data_dir: &Path, config: LsmConfig, cache: Arc<BlockCache>) -> ShrikeResult<Self> {
        Ok(Self {
            engine: LsmEngine::open(data_dir, config, cache)?,
            next_txn_id: AtomicU64::new(1),
            uncommitted: Mutex::new(BTreeSet::new()),
        })
    }

    pub(crate) fn register_txn(&self) -> TxnId {
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::Relaxed));
        self.uncommitted.lock().insert(id);
        id
    }

    pub(crate) fn deregister_txn(&self, id: TxnId) {
        self.uncommitted.lock().remove(&id);
    }

    fn has_uncommitted(&self) -> bool {
        !self.uncommitted.lock().is_empty()
    }

    fn uncommitted_snapshot(&self) -> BTreeSet<TxnId> {
        self.uncommitted.lock().clone()
    }
}

enum StoreState {
    Running(Arc<StoreCore>),
    Paused,
}

impl StoreState {
    fn name(&self) -> &'static str {
        match self {
            StoreState::Running(_) => "running",
            StoreState::Paused => "paused",
        }
    }
}

pub struct KVStore {
    id: String,
    root: PathBuf,
    engine_config: LsmConfig,
    cache: Arc<BlockCache>,
    state: RwLock<StoreState>,
    backup_outstanding: AtomicBool,
}

impl KVStore {
    /// Open a store under `<db_root>/<id>` and bring it to `Running`.
    pub fn open(
        id: impl Into<String>,
        db_root: &Path,
        engine_config: LsmConfig,
        cache: Arc<BlockCache>,
    ) -> ShrikeResult<Self> {
        let id = id.into();
        let root = db_root.join(&id);
        let core = StoreCore::open(&root.join("data"), engine_config.clone(), cache.clone())?;
        Ok(Self {
            id,
            root,
            engine_config,
            cache,
            state: RwLock::new(StoreState::Running(Arc::new(core))),
            backup_outstanding: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    /// Open a transaction. Fails unless the store is `Running`.
    pub fn create_transaction(&self) -> ShrikeResult<Transaction> {
        let state = self.state.read();
        match &*state {
            // Registration happens under the state lock, so `stop` cannot
            // slip between the check and the register.
            StoreState::Running(core) => Ok(Transaction::begin(core.clone())),
            other => Err(ShrikeError::BadState {
                op: "create_transaction",
                state: other.name(),
            }),
        }
    }

    /// Encoded point read through `txn`. Absent keys are `NotFound`.
    pub fn get_kv(&self, key: &RecordKey, txn: &Transaction) -> ShrikeResult<RecordValue> {
        match txn.get(&key.encode())? {
            Some(raw) => RecordValue::decode(&raw),
            None => Err(ShrikeError::NotFound),
        }
    }

    /// Buffer an encoded write in `txn`.
    pub fn set_kv(&self, key: &RecordKey, value: &RecordValue, txn: &mut Transaction) {
        txn.set(key.encode(), value.encode());
    }

    /// Buffer an encoded delete in `txn`.
    pub fn del_kv(&self, key: &RecordKey, txn: &mut Transaction) {
        txn.delete(key.encode());
    }

    /// `Running → Paused`. Fails while any transaction is registered.
    pub fn stop(&self) -> ShrikeResult<()> {
        let mut state = self.state.write();
        match &*state {
            StoreState::Running(core) => {
                if core.has_uncommitted() {
                    return Err(ShrikeError::BadState {
                        op: "stop",
                        state: "running with uncommitted transactions",
                    });
                }
                core.engine.shutdown()?;
                *state = StoreState::Paused;
                tracing::info!(store = %self.id, "store stopped");
                Ok(())
            }
            StoreState::Paused => Err(ShrikeError::BadState {
                op: "stop",
                state: "paused",
            }),
        }
    }

    /// Delete on-disk data. Requires `Paused`. The backup directory is
    /// untouched.
    pub fn clear(&self) -> ShrikeResult<()> {
        let state = self.state.write();
        match &*state {
            StoreState::Paused => {
                match fs::remove_dir_all(self.data_dir()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                tracing::info!(store = %self.id, "store data cleared");
                Ok(())
            }
            other => Err(ShrikeError::BadState {
                op: "clear",
                state: other.name(),
            }),
        }
    }

    /// `Paused → Running`, reopening the engine. With `reuse_data` the
    /// backup file set is restored into the data directory first.
    pub fn restart(&self, reuse_data: bool) -> ShrikeResult<()> {
        let mut state = self.state.write();
        match &*state {
            StoreState::Paused => {
                if reuse_data {
                    self.restore_backup()?;
                }
                let core =
                    StoreCore::open(&self.data_dir(), self.engine_config.clone(), self.cache.clone())?;
                *state = StoreState::Running(Arc::new(core));
                self.backup_outstanding.store(false, Ordering::SeqCst);
                tracing::info!(store = %self.id, reuse_data, "store restarted");
                Ok(())
            }
            other => Err(ShrikeError::BadState {
                op: "restart",
                state: other.name(),
            }),
        }
    }

    /// Snapshot the engine's file set into the backup directory.
    /// At most one backup may be outstanding; the flag resets on restart.
    pub fn backup(&self) -> ShrikeResult<BackupInfo> {
        let core = {
            let state = self.state.read();
            match &*state {
                StoreState::Running(core) => core.clone(),
                other => {
                    return Err(ShrikeError::BadState {
                        op: "backup",
                        state: other.name(),
                    })
                }
            }
        };

        if self
            .backup_outstanding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ShrikeError::BackupInProgress);
        }

        match self.run_backup(&core) {
            Ok(info) => {
                tracing::info!(store = %self.id, files = info.file_list.len(), "backup complete");
                Ok(info)
            }
            Err(e) => {
                self.backup_outstanding.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Ids of transactions currently registered against this store.
    pub fn uncommitted_txns(&self) -> BTreeSet<TxnId> {
        match &*self.state.read() {
            StoreState::Running(core) => core.uncommitted_snapshot(),
            StoreState::Paused => BTreeSet::new(),
        }
    }

    fn run_backup(&self, core: &StoreCore) -> ShrikeResult<BackupInfo> {
        core.engine.flush()?;

        let backup_dir = self.backup_dir();
        match fs::remove_dir_all(&backup_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&backup_dir)?;

        let mut file_list = Vec::new();
        for (name, size, path) in core.engine.files() {
            fs::copy(&path, backup_dir.join(&name))?;
            file_list.push((name, size));
        }
        Ok(BackupInfo { file_list })
    }

    fn restore_backup(&self) -> ShrikeResult<()> {
        let backup_dir = self.backup_dir();
        if !backup_dir.is_dir() {
            return Err(ShrikeError::invalid(format!(
                "store {}: restart(reuse_data) without a backup",
                self.id
            )));
        }
        fs::create_dir_all(self.data_dir())?;
        for entry in fs::read_dir(&backup_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if let Some(name) = path.file_name() {
                fs::copy(&path, self.data_dir().join(name))?;
            }
        }
        Ok(())
    }
}
