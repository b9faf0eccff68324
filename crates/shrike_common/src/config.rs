use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ShrikeError, ShrikeResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShrikeConfig {
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Storage section of `shrike.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend selector. Only `"lsm"` is supported.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Root data directory; each store gets its own subdirectory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Block cache budget in MB, shared by all stores through a single
    /// allocated cache.
    #[serde(default = "default_block_cache_mb")]
    pub block_cache_mb: u64,
    /// Number of KVStore instances (segments). User keys are hashed onto
    /// these.
    #[serde(default = "default_store_count")]
    pub store_count: u32,
    /// Per-store memtable budget in MB before a flush is triggered.
    #[serde(default = "default_memtable_budget_mb")]
    pub memtable_budget_mb: u64,
}

fn default_engine() -> String {
    "lsm".to_string()
}

fn default_db_path() -> String {
    "./db".to_string()
}

fn default_block_cache_mb() -> u64 {
    128
}

fn default_store_count() -> u32 {
    4
}

fn default_memtable_budget_mb() -> u64 {
    64
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            db_path: default_db_path(),
            block_cache_mb: default_block_cache_mb(),
            store_count: default_store_count(),
            memtable_budget_mb: default_memtable_budget_mb(),
        }
    }
}

impl ShrikeConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> ShrikeResult<Self> {
        let cfg: ShrikeConfig =
            toml::from_str(text).map_err(|e| ShrikeError::invalid(format!("config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> ShrikeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ShrikeResult<()> {
        if self.storage.engine != "lsm" {
            return Err(ShrikeError::invalid(format!(
                "unsupported storage engine '{}' (only 'lsm')",
                self.storage.engine
            )));
        }
        if self.storage.store_count == 0 {
            return Err(ShrikeError::invalid("store_count must be at least 1"));
        }
        if self.storage.db_path.is_empty() {
            return Err(ShrikeError::invalid("db_path must not be empty"));
        }
        Ok(())
    }
}
