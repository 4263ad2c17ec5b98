//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Transaction configuration
    pub transactions: TransactionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "balance-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            transactions: TransactionConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Transaction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// How long a transaction waits for a row lock (milliseconds)
    pub lock_timeout_ms: i64,

    /// Deadline after which an uncommitted transaction is rolled back (milliseconds)
    pub expiration_ms: i64,

    /// Retries on lock conflicts before surfacing `ConcurrencyConflict`
    pub max_conflict_retries: u32,

    /// Base delay between conflict retries (milliseconds, doubled per attempt)
    pub retry_backoff_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1_000,
            expiration_ms: 5_000,
            max_conflict_retries: 8,
            retry_backoff_ms: 5,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(timeout) = std::env::var("LEDGER_LOCK_TIMEOUT_MS") {
            config.transactions.lock_timeout_ms = timeout
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_LOCK_TIMEOUT_MS: {}", e)))?;
        }

        if let Ok(expiration) = std::env::var("LEDGER_TXN_EXPIRATION_MS") {
            config.transactions.expiration_ms = expiration
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_TXN_EXPIRATION_MS: {}", e)))?;
        }

        Ok(config)
    }
}
