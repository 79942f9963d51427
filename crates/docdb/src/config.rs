//! Storage and tablet configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Suffix of the intents store directory, appended to the tablet directory.
pub const INTENTS_DIR_SUFFIX: &str = ".intents";

/// Suffix of the snapshots directory, appended to the tablet directory.
pub const SNAPSHOTS_DIR_SUFFIX: &str = ".snapshots";

/// Configuration for the two fjall stores backing a tablet
#[derive(Clone)]
pub struct StorageConfig {
    /// Directory of the regular store. The intents store lives next to it
    /// with the `.intents` suffix.
    pub data_dir: PathBuf,

    /// Block cache size for Fjall (in bytes)
    pub block_cache_size: u64,

    /// Compression type for data
    pub compression: fjall::CompressionType,

    /// Persist mode used when flushing
    pub persist_mode: fjall::PersistMode,
}

impl StorageConfig {
    /// Create a new config with the given data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            block_cache_size: 64 * 1024 * 1024, // 64 MB
            compression: fjall::CompressionType::Lz4,
            persist_mode: fjall::PersistMode::SyncAll,
        }
    }

    /// Set block cache size
    pub fn with_block_cache_size(mut self, size: u64) -> Self {
        self.block_cache_size = size;
        self
    }

    /// Set compression type
    pub fn with_compression(mut self, compression: fjall::CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Set persist mode
    pub fn with_persist_mode(mut self, mode: fjall::PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }

    pub fn regular_dir(&self) -> PathBuf {
        self.data_dir.clone()
    }

    pub fn intents_dir(&self) -> PathBuf {
        with_suffix(&self.data_dir, INTENTS_DIR_SUFFIX)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        with_suffix(&self.data_dir, SNAPSHOTS_DIR_SUFFIX)
    }
}

fn with_suffix(dir: &Path, suffix: &str) -> PathBuf {
    let mut os = dir.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Tablet level knobs for reads, writes and history retention
#[derive(Debug, Clone)]
pub struct DocDbConfig {
    /// How much history is kept behind "now" for snapshot reads.
    pub history_retention_interval: Duration,

    /// Clock uncertainty window. Reads started at `t` must restart when they
    /// meet a record in `(t, t + max_clock_skew]`.
    pub max_clock_skew: Duration,

    /// Default wait for shared lock acquisition.
    pub lock_wait_timeout: Duration,

    /// Attempts made to resolve a transaction status returning `TryAgain`.
    pub status_retry_limit: usize,

    /// Initial backoff between status attempts, doubled on each retry.
    pub status_retry_backoff: Duration,

    /// Local read restarts allowed inside one write or read request.
    pub max_read_restarts: usize,

    /// Default time to live of rows written without an explicit TTL.
    pub table_ttl: Option<Duration>,
}

impl Default for DocDbConfig {
    fn default() -> Self {
        Self {
            history_retention_interval: Duration::from_secs(900),
            max_clock_skew: Duration::from_millis(500),
            lock_wait_timeout: Duration::from_secs(1),
            status_retry_limit: 10,
            status_retry_backoff: Duration::from_millis(2),
            max_read_restarts: 5,
            table_ttl: None,
        }
    }
}

impl DocDbConfig {
    pub fn with_history_retention_interval(mut self, interval: Duration) -> Self {
        self.history_retention_interval = interval;
        self
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_status_retry(mut self, limit: usize, backoff: Duration) -> Self {
        self.status_retry_limit = limit;
        self.status_retry_backoff = backoff;
        self
    }

    pub fn with_max_read_restarts(mut self, restarts: usize) -> Self {
        self.max_read_restarts = restarts;
        self
    }

    pub fn with_table_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.table_ttl = ttl;
        self
    }
}
