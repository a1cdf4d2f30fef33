//! Environment handle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::backup::Backup;
use crate::cleaner::verify::{self, VerifyProblem};
use crate::cleaner::{self, CleanerStats, FileSummary};
use crate::config::{
    CheckpointConfig, DatabaseConfig, EnvironmentConfig, LogScanConfig, MutableConfig, StatsConfig,
    TransactionConfig,
};
use crate::daemon::Daemons;
use crate::database::Database;
use crate::env::compress::CompressorStats;
use crate::env::scan::{self, ScannedRecord};
use crate::env::{EnvironmentImpl, compress, evictor};
use crate::log::Lsn;
use crate::recovery::checkpoint::{self, CheckpointStats};
use crate::transaction::Transaction;
use crate::txn::TxnStats;
use crate::txn::lock::{LockGrant, LockId, LockStats, LockType};
use crate::Error;

/// Node cache figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub resident_nodes: u64,
    pub budget_used: u64,
    pub budget_limit: u64,
    pub fetches: u64,
    pub nodes_evicted: u64,
    pub lns_stripped: u64,
}

/// Log figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub fsyncs: u64,
    pub entry_reads: u64,
    pub files_created: u64,
    /// Sleeps taken by the background I/O throttle.
    pub background_sleeps: u64,
    /// Bytes cut from an invalid log tail at open.
    pub truncated_tail: u64,
    pub end_of_log: Lsn,
}

/// Everything [`Environment::stats`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentStats {
    pub cache: CacheStats,
    pub log: LogStats,
    pub cleaner: CleanerStats,
    pub checkpoints: CheckpointStats,
    pub compressor: CompressorStats,
    pub locks: LockStats,
    pub txns: TxnStats,
}

// ------------------------------------------------------------------------------------------------
// Environment
// ------------------------------------------------------------------------------------------------

/// An open environment: one directory of log files holding any number of
/// named databases.
///
/// Opening runs recovery and starts the background daemons (none in a
/// read-only environment). Close it with [`close`](Self::close), which
/// stops the daemons and writes a final checkpoint; a dropped handle is
/// closed the same way, ignoring errors.
///
/// # Thread safety
///
/// `Environment` is `Send + Sync`; share it through `Arc<Environment>`.
pub struct Environment {
    env: Arc<EnvironmentImpl>,
    daemons: Mutex<Option<Daemons>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("home", &self.env.home)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Opens (or creates) the environment in `home`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad configuration or a missing directory
    /// without `allow_create`; `RunRecovery` or `Checksum` when the log
    /// cannot be recovered; `Io` for file system failures.
    pub fn open(home: impl AsRef<Path>, config: EnvironmentConfig) -> Result<Self, Error> {
        let env = EnvironmentImpl::open(home.as_ref(), config)?;
        let daemons = match Daemons::start(&env) {
            Ok(daemons) => daemons,
            Err(e) => {
                let _ = env.close(false);
                return Err(e);
            }
        };
        info!(home = %home.as_ref().display(), daemons = daemons.running(), "environment ready");
        Ok(Self {
            env,
            daemons: Mutex::new(Some(daemons)),
            closed: AtomicBool::new(false),
        })
    }

    /// Stops the daemons, checkpoints and closes the log.
    ///
    /// Subsequent operations on this handle, and on the database and
    /// cursor handles opened from it, return [`Error::Closed`]. Calling
    /// `close` more than once is harmless.
    ///
    /// # Errors
    ///
    /// The final checkpoint or log flush failed.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop_daemons();
        self.env.close(true)
    }

    pub fn home(&self) -> &Path {
        &self.env.home
    }

    /// False once a fatal error invalidated the environment; it must then
    /// be closed and reopened.
    pub fn is_valid(&self) -> bool {
        !self.env.is_closed() && self.env.validity.is_valid()
    }

    /// LSN the next log entry will get.
    pub fn end_of_log(&self) -> Lsn {
        self.env.log.end_of_log()
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `parent` is given (transactions do not nest),
    /// when the environment is not transactional, or for a conflicting
    /// configuration.
    pub fn begin_transaction(
        &self,
        parent: Option<&Transaction>,
        config: TransactionConfig,
    ) -> Result<Transaction, Error> {
        if let Some(parent) = parent {
            return Err(Error::InvalidArgument(format!(
                "nested transactions are not supported (parent {})",
                parent.id()
            )));
        }
        let txn = self.env.begin_txn(config)?;
        Ok(Transaction::new(Arc::clone(&self.env), txn))
    }

    // --------------------------------------------------------------------------------------------
    // Databases
    // --------------------------------------------------------------------------------------------

    /// Opens the database `name`, creating it when `config.allow_create`
    /// is set. The handle holds a read lock on the database until it is
    /// closed.
    ///
    /// # Errors
    ///
    /// `DatabaseNotFound`, `DatabaseExists` (with `exclusive_create`),
    /// `InvalidArgument` when the configuration disagrees with the stored
    /// database, `InvalidComparator` for an unknown or collapsing
    /// comparator, `LockTimeout` while another transaction is changing the
    /// database.
    pub fn open_database(
        &self,
        txn: Option<&Transaction>,
        name: &str,
        config: DatabaseConfig,
    ) -> Result<Database, Error> {
        let db = self.env.open_db(txn.map(|t| &t.txn), name, &config)?;
        let locker = self.env.txns.basic_locker();
        if locker.try_lock(LockId::Database(db.id), LockType::Read)? == LockGrant::Denied {
            return Err(Error::LockTimeout(format!(
                "database {name:?} is locked by a structural change"
            )));
        }
        Ok(Database::new(Arc::clone(&self.env), db, name, &config, locker))
    }

    /// Removes a database and everything in it.
    ///
    /// # Errors
    ///
    /// `DatabaseNotFound`, or `HandleOpen` while a handle is open on it.
    pub fn remove_database(&self, txn: Option<&Transaction>, name: &str) -> Result<(), Error> {
        self.env.remove_db(txn.map(|t| &t.txn), name)
    }

    /// # Errors
    ///
    /// `DatabaseNotFound`, `DatabaseExists` for a taken name, or
    /// `HandleOpen` while a handle is open on the database.
    pub fn rename_database(&self, txn: Option<&Transaction>, from: &str, to: &str) -> Result<(), Error> {
        self.env.rename_db(txn.map(|t| &t.txn), from, to)
    }

    /// Empties a database. Returns the number of records discarded when
    /// `count` is set, else 0.
    ///
    /// # Errors
    ///
    /// `DatabaseNotFound`, or `HandleOpen` while a handle is open on it.
    pub fn truncate_database(&self, txn: Option<&Transaction>, name: &str, count: bool) -> Result<u64, Error> {
        self.env.truncate_db(txn.map(|t| &t.txn), name, count)
    }

    /// Names of the databases, sorted.
    ///
    /// # Errors
    ///
    /// `Closed` or `RunRecovery`.
    pub fn database_names(&self) -> Result<Vec<String>, Error> {
        self.env.database_names()
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Writes a checkpoint. Without `force` nothing happens unless the
    /// checkpointer's bytes interval has passed.
    ///
    /// # Errors
    ///
    /// `ReadOnly`, `Closed`, `RunRecovery`, or log errors.
    pub fn checkpoint(&self, config: CheckpointConfig) -> Result<(), Error> {
        self.env.check_writable()?;
        checkpoint::run(&self.env, config.force, "api")?;
        Ok(())
    }

    /// Cleans log files until utilization is acceptable. Returns the
    /// number of files cleaned; they are deleted by the next checkpoint.
    ///
    /// # Errors
    ///
    /// `ReadOnly`, `Closed`, `RunRecovery`, or log errors.
    pub fn clean_log(&self) -> Result<u32, Error> {
        self.clean_log_with(true, false)
    }

    /// Cleans one file, or every qualifying file with `multiple`. With
    /// `force` the least utilized eligible file is cleaned even when
    /// utilization is above the thresholds.
    ///
    /// # Errors
    ///
    /// As for [`clean_log`](Self::clean_log).
    pub fn clean_log_with(&self, multiple: bool, force: bool) -> Result<u32, Error> {
        self.env.guard(cleaner::clean_log(&self.env, multiple, force))
    }

    /// Removes deleted slots now instead of waiting for the compressor
    /// daemon. Returns the number of slots removed.
    ///
    /// # Errors
    ///
    /// `ReadOnly`, `Closed`, `RunRecovery`.
    pub fn compress(&self) -> Result<u64, Error> {
        self.env.check_writable()?;
        self.env.guard(compress::run(&self.env))
    }

    /// Brings the cache within its budget now. Returns the number of
    /// nodes evicted.
    ///
    /// # Errors
    ///
    /// `Closed`, `RunRecovery`, or a failure to log a dirty node.
    pub fn evict_memory(&self) -> Result<u64, Error> {
        self.env.check_usable()?;
        let run = self.env.guard(evictor::evict_memory(&self.env))?;
        Ok(run.nodes_evicted)
    }

    /// Writes and fsyncs the log buffer.
    ///
    /// # Errors
    ///
    /// `ReadOnly`, `Closed`, or the I/O failure, which also invalidates
    /// the environment.
    pub fn sync(&self) -> Result<(), Error> {
        self.env.check_writable()?;
        self.env.guard(self.env.log.flush(true).map_err(Error::from))
    }

    /// Starts a hot backup. The returned [`Backup`] lists the log files
    /// to copy and keeps the cleaner from deleting them until it ends.
    ///
    /// # Errors
    ///
    /// `Closed`, `RunRecovery`, or the I/O failure rolling the log.
    pub fn start_backup(&self) -> Result<Backup, Error> {
        Backup::start(&self.env)
    }

    /// Checks every database tree against the log files and the
    /// utilization summaries. An empty result means the cleaner's view of
    /// the log agrees with the trees.
    ///
    /// # Errors
    ///
    /// `Closed`, `RunRecovery`, or a log read failure.
    pub fn verify_utilization(&self) -> Result<Vec<VerifyProblem>, Error> {
        self.env.check_usable()?;
        verify::verify_utilization(&self.env)
    }

    // --------------------------------------------------------------------------------------------
    // Statistics
    // --------------------------------------------------------------------------------------------

    /// # Errors
    ///
    /// `Closed` or `RunRecovery`.
    pub fn stats(&self, config: StatsConfig) -> Result<EnvironmentStats, Error> {
        self.env.check_usable()?;
        let clear = config.clear;
        let load = |c: &std::sync::atomic::AtomicU64| {
            if clear {
                c.swap(0, Ordering::Relaxed)
            } else {
                c.load(Ordering::Relaxed)
            }
        };
        let env = &self.env;
        let cache_stats = env.cache.stats();
        let budget = env.cache.budget();
        let cache = CacheStats {
            resident_nodes: env.cache.resident_count() as u64,
            budget_used: budget.used(),
            budget_limit: budget.limit(),
            fetches: load(&cache_stats.fetches),
            nodes_evicted: load(&cache_stats.nodes_evicted),
            lns_stripped: load(&cache_stats.lns_stripped),
        };
        let log_stats = env.log.stats();
        let log = LogStats {
            entries_written: load(&log_stats.entries_written),
            bytes_written: load(&log_stats.bytes_written),
            fsyncs: load(&log_stats.fsyncs),
            entry_reads: load(&log_stats.entry_reads),
            files_created: load(&log_stats.files_created),
            background_sleeps: env.io.sleeps(),
            truncated_tail: env.log.truncated_tail(),
            end_of_log: env.log.end_of_log(),
        };
        if clear {
            env.io.clear_stats();
        }
        Ok(EnvironmentStats {
            cache,
            log,
            cleaner: env.cleaner.stats(clear),
            checkpoints: env.checkpointer.stats(clear),
            compressor: env.compressor.stats(clear),
            locks: env.txns.lock_manager().stats(clear),
            txns: env.txns.stats(clear),
        })
    }

    /// # Errors
    ///
    /// `Closed` or `RunRecovery`.
    pub fn lock_stats(&self, config: StatsConfig) -> Result<LockStats, Error> {
        self.env.check_usable()?;
        Ok(self.env.txns.lock_manager().stats(config.clear))
    }

    /// Utilization summary of every log file the cleaner tracks.
    ///
    /// # Errors
    ///
    /// `Closed` or `RunRecovery`.
    pub fn file_summaries(&self) -> Result<BTreeMap<u32, FileSummary>, Error> {
        self.env.check_usable()?;
        Ok(self.env.tracker.summaries())
    }

    /// Visits the data records of user databases logged between `start`
    /// and `end`. A forward scan needs `start < end`, a backward scan
    /// `start > end`; both bounds must lie at or below the end of the log.
    /// The visitor stops the scan by returning false.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad range, log errors otherwise.
    pub fn scan_log(
        &self,
        start: Lsn,
        end: Lsn,
        config: LogScanConfig,
        mut visitor: impl FnMut(ScannedRecord) -> bool,
    ) -> Result<(), Error> {
        scan::scan_log(&self.env, start, end, &config, &mut visitor)
    }

    // --------------------------------------------------------------------------------------------
    // Configuration
    // --------------------------------------------------------------------------------------------

    /// Publishes new runtime parameters; the daemons pick them up on their
    /// next wake-up.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a value out of range, `Closed`.
    pub fn set_mutable_config(&self, config: MutableConfig) -> Result<(), Error> {
        self.env.check_usable()?;
        self.env.mutable.set(config.clone())?;
        self.env.io.apply(&config);
        self.env.cache.budget().set_limit(config.cache_size);
        Ok(())
    }

    pub fn mutable_config(&self) -> MutableConfig {
        self.env.mutable.snapshot().config.clone()
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Abandons the environment the way a process crash would: the log
    /// buffer reaches the files, nothing else is written.
    #[cfg(test)]
    pub(crate) fn crash(self) {
        self.closed.store(true, Ordering::Release);
        self.stop_daemons();
        let _ = self.env.log.flush(false);
        self.env.abandon();
    }

    fn stop_daemons(&self) {
        if let Some(mut daemons) = self.daemons.lock().take() {
            daemons.stop();
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.stop_daemons();
            let _ = self.env.close(true);
        }
    }
}
