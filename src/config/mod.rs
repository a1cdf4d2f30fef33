//! Configuration of environments, databases, transactions and cursors.
//!
//! Every structure here is a plain value with [`Default`] and a `validate()`
//! method; nothing is cloned behind the caller's back. The environment-wide
//! parameters that may change while the environment is open live in
//! [`MutableConfig`] and are published through a [`ConfigManager`], which
//! keeps a versioned snapshot and pushes a [`ConfigEvent`] to every daemon
//! that subscribed. Daemons drain their event queue on each wake-up.

#[cfg(test)]
mod tests;

use std::{fmt, sync::Arc, time::Duration};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

use crate::tree::comparator::ComparatorRegistry;

/// Callback run by the background I/O throttle right before it sleeps.
pub type IoSleepHook = Arc<dyn Fn() + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// A configuration value is out of range or inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The offending parameter and why it was rejected.
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ------------------------------------------------------------------------------------------------
// Environment
// ------------------------------------------------------------------------------------------------

/// Configuration for opening an [`Environment`](crate::Environment).
///
/// All fields have defaults via [`EnvironmentConfig::default()`]. The
/// configuration is validated when passed to
/// [`Environment::open`](crate::Environment::open).
///
/// # Example
///
/// ```rust
/// use arborlog::EnvironmentConfig;
///
/// let config = EnvironmentConfig {
///     log_file_max: 64 * 1024,
///     ..EnvironmentConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct EnvironmentConfig {
    /// Create the environment if the directory holds no log.
    ///
    /// Default: true.
    pub allow_create: bool,

    /// Open without writing anything. Daemons do not run and recovery does
    /// not checkpoint.
    ///
    /// Default: false.
    pub read_only: bool,

    /// Allow transactions.
    ///
    /// Default: true.
    pub transactional: bool,

    /// Maximum entries per tree node. Default: 128. Must be ≥ 4.
    pub node_max_entries: usize,

    /// Maximum entries per duplicate subtree node. Default: 128. Must be ≥ 4.
    pub dup_node_max_entries: usize,

    /// Log file size at which the log rolls to a new file.
    ///
    /// Default: 10,000,000. Must be in `[4096, 2^30]`.
    pub log_file_max: u32,

    /// Size of the in-memory log buffer. Default: 64 KiB. Must be ≥ 1024.
    pub log_buffer_size: usize,

    /// How long a lock request waits before failing. Default: 500 ms.
    pub lock_timeout: Duration,

    /// Number of lock table buckets. Default: 1. Must be in `[1, 32767]`.
    pub lock_tables: usize,

    /// Log bytes written between checkpoints. Default: 20,000,000.
    pub checkpointer_bytes_interval: u64,

    /// Poll period of the checkpointer, cleaner and evictor daemons.
    ///
    /// Default: 1 s.
    pub daemon_wakeup_interval: Duration,

    /// Poll period of the compressor daemon. Default: 5 s.
    pub compressor_wakeup_interval: Duration,

    /// Times the cleaner retries a locked record before giving up on a file.
    ///
    /// Default: 3.
    pub cleaner_deadlock_retry: u32,

    /// Lock timeout used by the cleaner. Default: 500 ms.
    pub cleaner_lock_timeout: Duration,

    /// Number of most recent files the cleaner never selects. Default: 2.
    pub cleaner_min_age: u32,

    /// Comparators that databases may name.
    pub comparators: ComparatorRegistry,

    /// Test hook run before each background I/O sleep.
    pub io_sleep_hook: Option<IoSleepHook>,

    /// Initial values of the runtime-mutable parameters.
    pub mutable: MutableConfig,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            allow_create: true,
            read_only: false,
            transactional: true,
            node_max_entries: 128,
            dup_node_max_entries: 128,
            log_file_max: 10_000_000,
            log_buffer_size: 64 * 1024,
            lock_timeout: Duration::from_millis(500),
            lock_tables: 1,
            checkpointer_bytes_interval: 20_000_000,
            daemon_wakeup_interval: Duration::from_secs(1),
            compressor_wakeup_interval: Duration::from_secs(5),
            cleaner_deadlock_retry: 3,
            cleaner_lock_timeout: Duration::from_millis(500),
            cleaner_min_age: 2,
            comparators: ComparatorRegistry::default(),
            io_sleep_hook: None,
            mutable: MutableConfig::default(),
        }
    }
}

impl fmt::Debug for EnvironmentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentConfig")
            .field("allow_create", &self.allow_create)
            .field("read_only", &self.read_only)
            .field("transactional", &self.transactional)
            .field("node_max_entries", &self.node_max_entries)
            .field("dup_node_max_entries", &self.dup_node_max_entries)
            .field("log_file_max", &self.log_file_max)
            .field("log_buffer_size", &self.log_buffer_size)
            .field("lock_timeout", &self.lock_timeout)
            .field("lock_tables", &self.lock_tables)
            .field("checkpointer_bytes_interval", &self.checkpointer_bytes_interval)
            .field("comparators", &self.comparators)
            .field("io_sleep_hook", &self.io_sleep_hook.is_some())
            .field("mutable", &self.mutable)
            .finish_non_exhaustive()
    }
}

impl EnvironmentConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_max_entries < 4 || self.node_max_entries > 32_767 {
            return Err(invalid("node_max_entries must be in [4, 32767]"));
        }
        if self.dup_node_max_entries < 4 || self.dup_node_max_entries > 32_767 {
            return Err(invalid("dup_node_max_entries must be in [4, 32767]"));
        }
        if self.log_file_max < 4096 || self.log_file_max > 1 << 30 {
            return Err(invalid("log_file_max must be in [4096, 2^30]"));
        }
        if self.log_buffer_size < 1024 {
            return Err(invalid("log_buffer_size must be >= 1024"));
        }
        if self.lock_tables == 0 || self.lock_tables > 32_767 {
            return Err(invalid("lock_tables must be in [1, 32767]"));
        }
        if self.lock_timeout.is_zero() {
            return Err(invalid("lock_timeout must be > 0"));
        }
        if self.checkpointer_bytes_interval == 0 {
            return Err(invalid("checkpointer_bytes_interval must be > 0"));
        }
        if self.daemon_wakeup_interval.is_zero() || self.compressor_wakeup_interval.is_zero() {
            return Err(invalid("daemon wakeup intervals must be > 0"));
        }
        if self.cleaner_lock_timeout.is_zero() {
            return Err(invalid("cleaner_lock_timeout must be > 0"));
        }
        self.mutable.validate()
    }
}

// ------------------------------------------------------------------------------------------------
// Mutable parameters
// ------------------------------------------------------------------------------------------------

/// Environment parameters that may change while the environment is open,
/// through [`Environment::set_mutable_config`](crate::Environment::set_mutable_config).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableConfig {
    /// Run the cleaner daemon. Default: true.
    pub run_cleaner: bool,

    /// Run the checkpointer daemon. Default: true.
    pub run_checkpointer: bool,

    /// Run the compressor daemon. Default: true.
    pub run_compressor: bool,

    /// Run the evictor daemon. Default: true.
    pub run_evictor: bool,

    /// Node cache budget in bytes. Default: 64 MiB. Must be ≥ 64 KiB.
    pub cache_size: u64,

    /// Total log utilization (percent) below which the cleaner works.
    ///
    /// Default: 50. Must be in `[0, 90]`.
    pub cleaner_min_utilization: u8,

    /// Single-file utilization (percent) below which that file is cleaned
    /// regardless of the total. Default: 5. Must be in `[0, 50]`.
    pub cleaner_min_file_utilization: u8,

    /// Log bytes written between cleaner wake-ups. Default: 2,500,000.
    pub cleaner_bytes_interval: u64,

    /// Files cleaned regardless of utilization.
    pub force_clean_files: Vec<u32>,

    /// Background reads per sleep interval; 0 disables throttling.
    pub background_read_limit: u32,

    /// Background writes per sleep interval; 0 disables throttling.
    pub background_write_limit: u32,

    /// Length of one background I/O sleep. Default: 1 ms.
    pub background_sleep_interval: Duration,
}

impl Default for MutableConfig {
    fn default() -> Self {
        Self {
            run_cleaner: true,
            run_checkpointer: true,
            run_compressor: true,
            run_evictor: true,
            cache_size: 64 * 1024 * 1024,
            cleaner_min_utilization: 50,
            cleaner_min_file_utilization: 5,
            cleaner_bytes_interval: 2_500_000,
            force_clean_files: Vec::new(),
            background_read_limit: 0,
            background_write_limit: 0,
            background_sleep_interval: Duration::from_millis(1),
        }
    }
}

impl MutableConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size < 64 * 1024 {
            return Err(invalid("cache_size must be >= 65536"));
        }
        if self.cleaner_min_utilization > 90 {
            return Err(invalid("cleaner_min_utilization must be in [0, 90]"));
        }
        if self.cleaner_min_file_utilization > 50 {
            return Err(invalid("cleaner_min_file_utilization must be in [0, 50]"));
        }
        if self.cleaner_bytes_interval == 0 {
            return Err(invalid("cleaner_bytes_interval must be > 0"));
        }
        if self.background_sleep_interval > Duration::from_secs(24 * 3600) {
            return Err(invalid("background_sleep_interval must be <= 24h"));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Versioned mutable snapshot
// ------------------------------------------------------------------------------------------------

/// One published version of the mutable parameters.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Incremented on every successful change.
    pub version: u64,
    /// The parameters in effect.
    pub config: MutableConfig,
}

/// Notification that a new snapshot was published.
#[derive(Debug, Clone)]
pub(crate) struct ConfigEvent {
    pub snapshot: Arc<ConfigSnapshot>,
}

/// Holds the current mutable configuration and notifies subscribers of
/// every change.
pub(crate) struct ConfigManager {
    current: RwLock<Arc<ConfigSnapshot>>,
    subscribers: Mutex<Vec<Sender<ConfigEvent>>>,
}

impl ConfigManager {
    pub fn new(config: MutableConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(ConfigSnapshot { version: 0, config })),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The snapshot in effect right now.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Validates and publishes a new configuration, returning its version.
    pub fn set(&self, config: MutableConfig) -> Result<u64, ConfigError> {
        config.validate()?;
        let snapshot = {
            let mut current = self.current.write();
            let next = Arc::new(ConfigSnapshot {
                version: current.version + 1,
                config,
            });
            *current = Arc::clone(&next);
            next
        };
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| {
            tx.send(ConfigEvent {
                snapshot: Arc::clone(&snapshot),
            })
            .is_ok()
        });
        info!(
            version = snapshot.version,
            subscribers = subscribers.len(),
            "mutable config published"
        );
        Ok(snapshot.version)
    }

    /// Registers a new event queue.
    pub fn subscribe(&self) -> Receiver<ConfigEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        debug!("config subscriber added");
        rx
    }
}

// ------------------------------------------------------------------------------------------------
// Database
// ------------------------------------------------------------------------------------------------

/// Configuration for [`Environment::open_database`](crate::Environment::open_database).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Create the database if it does not exist. Default: false.
    pub allow_create: bool,

    /// Fail with `DatabaseExists` if the database already exists.
    pub exclusive_create: bool,

    /// Allow several data items per key, kept sorted by the duplicate
    /// comparator.
    pub sorted_duplicates: bool,

    /// Operations without an explicit transaction auto-commit.
    ///
    /// Default: true.
    pub transactional: bool,

    /// Reject writes through this handle.
    pub read_only: bool,

    /// Registered name of the key comparator; `None` means byte order.
    pub btree_comparator: Option<String>,

    /// Registered name of the duplicate comparator; `None` means byte order.
    pub duplicate_comparator: Option<String>,

    /// Overrides the environment's node fanout for a new database.
    pub node_max_entries: Option<usize>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            allow_create: false,
            exclusive_create: false,
            sorted_duplicates: false,
            transactional: true,
            read_only: false,
            btree_comparator: None,
            duplicate_comparator: None,
            node_max_entries: None,
        }
    }
}

impl DatabaseConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exclusive_create && !self.allow_create {
            return Err(invalid("exclusive_create requires allow_create"));
        }
        if self.duplicate_comparator.is_some() && !self.sorted_duplicates {
            return Err(invalid("duplicate_comparator requires sorted_duplicates"));
        }
        if let Some(n) = self.node_max_entries {
            if !(4..=32_767).contains(&n) {
                return Err(invalid("node_max_entries must be in [4, 32767]"));
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Transactions and cursors
// ------------------------------------------------------------------------------------------------

/// How far a commit pushes its log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Write and fsync the log.
    #[default]
    Sync,
    /// Write the log buffer to the OS without fsync.
    WriteNoSync,
    /// Leave the commit record in the log buffer.
    NoSync,
}

/// Configuration for [`Environment::begin_transaction`](crate::Environment::begin_transaction).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Use range locks so that no phantom is ever observed.
    pub serializable: bool,

    /// Release read locks as soon as the cursor moves on.
    pub read_committed: bool,

    /// Take no read locks; may observe uncommitted data.
    pub read_uncommitted: bool,

    /// Commit durability.
    pub durability: Durability,

    /// Fail immediately instead of waiting for a lock.
    pub no_wait: bool,

    /// Overrides the environment lock timeout.
    pub lock_timeout: Option<Duration>,
}

impl TransactionConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let levels = [self.serializable, self.read_committed, self.read_uncommitted]
            .iter()
            .filter(|&&b| b)
            .count();
        if levels > 1 {
            return Err(invalid(
                "serializable, read_committed and read_uncommitted are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Configuration for [`Database::open_cursor`](crate::Database::open_cursor).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorConfig {
    /// Release read locks as soon as the cursor moves on.
    pub read_committed: bool,

    /// Take no read locks.
    pub read_uncommitted: bool,
}

impl CursorConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_committed && self.read_uncommitted {
            return Err(invalid(
                "read_committed and read_uncommitted are mutually exclusive",
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Maintenance
// ------------------------------------------------------------------------------------------------

/// Configuration for [`Environment::checkpoint`](crate::Environment::checkpoint).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Checkpoint even if few bytes were logged since the last one.
    pub force: bool,
}

/// Configuration for [`Environment::stats`](crate::Environment::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsConfig {
    /// Reset the counters after reading them.
    pub clear: bool,
}

/// Configuration for [`Environment::scan_log`](crate::Environment::scan_log).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogScanConfig {
    /// Scan in log order; `false` scans backwards.
    ///
    /// Default: true.
    pub forwards: bool,
}

impl Default for LogScanConfig {
    fn default() -> Self {
        Self { forwards: true }
    }
}
