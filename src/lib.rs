//! # ArborLog
//!
//! An embeddable, transactional key-value storage engine built on a
//! **log-structured B+tree**. Every change, to data and to the tree
//! itself, is appended to a sequence of log files; nothing is updated in
//! place. Background daemons checkpoint the tree, compress away deleted
//! slots, evict cold nodes and clean log files whose contents went stale.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arborlog::{
//!     DatabaseConfig, DatabaseEntry, Environment, EnvironmentConfig, LockMode, TransactionConfig,
//! };
//!
//! let env = Environment::open("/tmp/my_env", EnvironmentConfig::default()).unwrap();
//! let db = env
//!     .open_database(None, "people", DatabaseConfig { allow_create: true, ..Default::default() })
//!     .unwrap();
//!
//! // Auto-commit write
//! db.put(None, &DatabaseEntry::new(b"ada"), &DatabaseEntry::new(b"lovelace")).unwrap();
//! assert_eq!(db.get(None, b"ada", LockMode::Default).unwrap(), Some(b"lovelace".to_vec()));
//!
//! // Explicit transaction
//! let txn = env.begin_transaction(None, TransactionConfig::default()).unwrap();
//! db.put(Some(&txn), &DatabaseEntry::new(b"alan"), &DatabaseEntry::new(b"turing")).unwrap();
//! txn.commit().unwrap();
//!
//! // Cursor scan
//! let mut cursor = db.open_cursor(None, Default::default()).unwrap();
//! while let Some((key, data)) = cursor.next(LockMode::Default).unwrap() {
//!     println!("{:?} => {:?}", key, data);
//! }
//! cursor.close();
//!
//! // Graceful shutdown
//! db.close().unwrap();
//! env.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **ACID transactions** with record locking, deadlock detection and
//!   serializable, repeatable-read, read-committed or read-uncommitted
//!   isolation.
//! - **Sorted duplicates**: several data items per key, each in its own
//!   duplicate tree.
//! - **Crash recovery** from the last checkpoint, redoing committed work
//!   and undoing the rest.
//! - **Log cleaning**: per-file utilization tracking, with live records of
//!   under-used files migrated forward so the files can be deleted.
//! - **Hot backups**: a [`Backup`] pins the log files it lists until it
//!   ends, so the cleaner cannot delete them mid-copy.
//! - **CRC32 integrity**: every log entry is checksummed.

#![allow(dead_code)]

pub(crate) mod backup;
pub(crate) mod cleaner;
pub(crate) mod config;
pub(crate) mod cursor;
pub(crate) mod daemon;
pub(crate) mod database;
pub(crate) mod encoding;
pub(crate) mod env;
pub(crate) mod environment;
pub(crate) mod log;
pub(crate) mod record;
pub(crate) mod recovery;
pub(crate) mod transaction;
pub(crate) mod tree;
pub(crate) mod txn;

use std::io;

use thiserror::Error;

pub use backup::Backup;
pub use cleaner::{CleanerError, CleanerStats, FileSummary, VerifyProblem};
pub use config::{
    CheckpointConfig, ConfigError, CursorConfig, DatabaseConfig, Durability, EnvironmentConfig,
    IoSleepHook, LogScanConfig, MutableConfig, StatsConfig, TransactionConfig,
};
pub use cursor::Cursor;
pub use database::Database;
pub use encoding::EncodingError;
pub use env::compress::CompressorStats;
pub use env::scan::ScannedRecord;
pub use environment::{CacheStats, Environment, EnvironmentStats, LogStats};
pub use log::{LogError, Lsn};
pub use record::{DatabaseEntry, LockMode, OperationStatus, Partial};
pub use recovery::RecoveryError;
pub use recovery::checkpoint::CheckpointStats;
pub use transaction::Transaction;
pub use tree::{BtreeStats, TreeError};
pub use tree::comparator::{ByteComparator, Comparator, ComparatorRegistry, ReverseByteComparator};
pub use tree::latch::latches_held;
pub use txn::TxnStats;
pub use txn::lock::{LockError, LockStats, LockType};

/// Identifier of a database, stable across renames.
pub type DatabaseId = u64;

/// A key and its data, as returned by cursor moves.
pub type KeyValue = (Vec<u8>, Vec<u8>);

pub(crate) type NodeId = u64;
pub(crate) type TxnId = u64;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by the public handles.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad parameter, configuration or call sequence.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was chosen as a deadlock victim; abort the
    /// transaction and retry.
    #[error("deadlock: {0}")]
    Deadlock(String),

    /// A lock was not granted within the lock timeout.
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("database not found: {0}")]
    DatabaseNotFound(String),

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    /// A handle is open on a database being removed, renamed or truncated.
    #[error("database handle open: {0}")]
    HandleOpen(String),

    /// A log entry failed checksum validation.
    #[error("checksum failure: {0}")]
    Checksum(String),

    /// The environment hit an unrecoverable condition and must be closed
    /// and reopened.
    #[error("run recovery: {0}")]
    RunRecovery(String),

    /// A comparator is not registered, or disagrees with the one the
    /// database was created with.
    #[error("invalid comparator: {0}")]
    InvalidComparator(String),

    /// Write to a read-only environment or handle.
    #[error("environment or handle is read-only")]
    ReadOnly,

    /// The environment or handle has been closed.
    #[error("environment or handle is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<LogError> for Error {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Io(io) => Error::Io(io),
            LogError::Checksum { lsn } => Error::Checksum(format!("log entry at {lsn}")),
            LogError::ReadOnly => Error::ReadOnly,
            other => Error::RunRecovery(other.to_string()),
        }
    }
}

impl From<TreeError> for Error {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::Log(log) => Error::from(log),
            TreeError::InvalidComparator(msg) => Error::InvalidComparator(msg),
            TreeError::Corrupt(msg) => Error::RunRecovery(msg),
        }
    }
}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Deadlock { .. } | LockError::NotGranted { .. } => Error::Deadlock(e.to_string()),
            LockError::Timeout { .. } => Error::LockTimeout(e.to_string()),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<EncodingError> for Error {
    fn from(e: EncodingError) -> Self {
        Error::RunRecovery(e.to_string())
    }
}

impl From<CleanerError> for Error {
    fn from(e: CleanerError) -> Self {
        Error::RunRecovery(e.to_string())
    }
}

impl From<RecoveryError> for Error {
    fn from(e: RecoveryError) -> Self {
        Error::RunRecovery(e.to_string())
    }
}
