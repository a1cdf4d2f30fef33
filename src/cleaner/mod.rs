//! Log cleaning.
//!
//! The log is append-only, so the space held by superseded entries is only
//! reclaimed by deleting whole files. The cleaner picks the files with the
//! lowest utilization (see [`summary`]), migrates every entry that is
//! still live to the end of the log, and hands the file to the next
//! checkpoint, which deletes it once the nodes referring to the new
//! locations are durable.
//!
//! ## File life cycle
//!
//! ```text
//! candidate --select--> being cleaned --processed--> cleaned
//!     ^                       |                         |
//!     +-------deferred--------+              checkpoint start
//!                                                       v
//!                                 deleted <--ckpt end-- checkpointed
//! ```
//!
//! A file is deferred when one of its records stayed locked past the
//! cleaner lock timeout; it becomes a candidate again for later runs.
//!
//! A checkpointed file is not deleted while an open backup set includes
//! it, or while a read-only environment holds the directory lock. It stays
//! checkpointed and the next checkpoint tries again.
//!
//! ## Pending databases
//!
//! Deleting a database walks its whole tree to count every entry obsolete,
//! loading evicted nodes from the log as it goes. While that walk runs the
//! database is pending: the cleaner counts its entries obsolete without
//! touching them, and notes each file where it met one. Such a file is not
//! handed out for deletion until every database it waits on is gone.

pub(crate) mod processor;
pub(crate) mod selector;
mod summary;
pub(crate) mod verify;

#[cfg(test)]
mod tests;

pub(crate) use summary::{
    DbFileSummary, Obsolete, SummaryRecord, UtilizationTracker, file_from_summary_key, summary_key,
    utilization,
};
pub use summary::FileSummary;
pub use verify::VerifyProblem;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::env::EnvironmentImpl;
use crate::{DatabaseId, Error};

use processor::FileOutcome;

/// Errors specific to cleaning.
#[derive(Debug, thiserror::Error)]
pub enum CleanerError {
    /// A file was handed to the cleaner twice.
    #[error("log file {0} is already being cleaned")]
    AlreadyCleaning(u32),

    /// A file that the checkpointer expected to delete could not be removed.
    #[error("log file {file} could not be deleted: {reason}")]
    Delete { file: u32, reason: String },
}

/// Cleaner statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanerStats {
    pub runs: u64,
    pub files_cleaned: u64,
    pub files_deleted: u64,
    /// Files left for a later run because a record stayed locked.
    pub files_deferred: u64,
    pub lns_migrated: u64,
    pub lns_obsolete: u64,
    pub lns_locked: u64,
    pub ins_dirtied: u64,
    pub ins_obsolete: u64,
    /// Files cleaned and waiting for a checkpoint to delete them.
    pub backlog: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub runs: AtomicU64,
    pub files_cleaned: AtomicU64,
    pub files_deleted: AtomicU64,
    pub files_deferred: AtomicU64,
    pub lns_migrated: AtomicU64,
    pub lns_obsolete: AtomicU64,
    pub lns_locked: AtomicU64,
    pub ins_dirtied: AtomicU64,
    pub ins_obsolete: AtomicU64,
}

#[derive(Debug, Default)]
struct FileStates {
    being_cleaned: BTreeSet<u32>,
    /// Processed; every live entry has moved.
    cleaned: BTreeSet<u32>,
    /// Cleaned before the running checkpoint started.
    checkpointed: BTreeSet<u32>,
    /// Databases whose deletion is running.
    pending_dbs: BTreeSet<DatabaseId>,
    /// Files holding entries of a pending database, with those databases.
    waiting: BTreeMap<u32, BTreeSet<DatabaseId>>,
}

/// Marks a database pending until dropped.
pub(crate) struct PendingDb<'a> {
    cleaner: &'a Cleaner,
    id: DatabaseId,
}

impl Drop for PendingDb<'_> {
    fn drop(&mut self) {
        self.cleaner.states.lock().pending_dbs.remove(&self.id);
    }
}

pub(crate) struct Cleaner {
    states: Mutex<FileStates>,
    /// Open backups by id, each with the last file of its backup set.
    backups: Mutex<BTreeMap<u64, u32>>,
    next_backup: AtomicU64,
    /// Serializes runs.
    run_lock: Mutex<()>,
    /// Log size at the end of the last run, for the bytes interval.
    last_run_bytes: AtomicU64,
    pub(crate) counters: Counters,
}

impl Cleaner {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(FileStates::default()),
            backups: Mutex::new(BTreeMap::new()),
            next_backup: AtomicU64::new(1),
            run_lock: Mutex::new(()),
            last_run_bytes: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// True when `file` is being cleaned or already waits for deletion.
    pub fn is_claimed(&self, file: u32) -> bool {
        let states = self.states.lock();
        states.being_cleaned.contains(&file)
            || states.cleaned.contains(&file)
            || states.checkpointed.contains(&file)
    }

    fn claim(&self, file: u32) -> Result<(), CleanerError> {
        let mut states = self.states.lock();
        if states.cleaned.contains(&file) || states.checkpointed.contains(&file) {
            return Err(CleanerError::AlreadyCleaning(file));
        }
        if !states.being_cleaned.insert(file) {
            return Err(CleanerError::AlreadyCleaning(file));
        }
        Ok(())
    }

    fn finish(&self, file: u32, cleaned: bool) {
        let mut states = self.states.lock();
        states.being_cleaned.remove(&file);
        if cleaned {
            states.cleaned.insert(file);
        }
    }

    /// Called when a checkpoint starts: the files cleaned so far become
    /// deletable once it ends.
    ///
    /// Files still waiting on a pending database are left out.
    pub fn checkpoint_started(&self) -> Vec<u32> {
        let mut states = self.states.lock();
        let cleaned = std::mem::take(&mut states.cleaned);
        states.checkpointed.extend(cleaned);
        let FileStates {
            checkpointed,
            pending_dbs,
            waiting,
            ..
        } = &mut *states;
        waiting.retain(|_, dbs| {
            dbs.retain(|id| pending_dbs.contains(id));
            !dbs.is_empty()
        });
        checkpointed
            .iter()
            .copied()
            .filter(|file| !waiting.contains_key(file))
            .collect()
    }

    /// Called once a file handed out by
    /// [`checkpoint_started`](Self::checkpoint_started) is gone.
    pub fn file_deleted(&self, file: u32) {
        let mut states = self.states.lock();
        states.checkpointed.remove(&file);
        states.waiting.remove(&file);
        drop(states);
        self.counters.files_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Marks `id` pending for the life of the returned guard.
    pub fn deleting_db(&self, id: DatabaseId) -> PendingDb<'_> {
        self.states.lock().pending_dbs.insert(id);
        PendingDb { cleaner: self, id }
    }

    /// When `id` is pending, records that `file` holds one of its entries
    /// and returns true.
    pub fn wait_if_pending(&self, file: u32, id: DatabaseId) -> bool {
        let mut states = self.states.lock();
        if !states.pending_dbs.contains(&id) {
            return false;
        }
        states.waiting.entry(file).or_default().insert(id);
        true
    }

    /// Pins every file up to `last_file` against deletion and runs `list`
    /// while no deletion can interleave. Returns the backup id.
    pub fn pin_backup<T>(&self, last_file: u32, list: impl FnOnce() -> T) -> (u64, T) {
        let mut backups = self.backups.lock();
        let id = self.next_backup.fetch_add(1, Ordering::Relaxed);
        backups.insert(id, last_file);
        (id, list())
    }

    /// Releases a backup pin. False when `id` was not pinned.
    pub fn unpin_backup(&self, id: u64) -> bool {
        self.backups.lock().remove(&id).is_some()
    }

    /// Highest file number some open backup set includes.
    pub fn backup_horizon(&self) -> Option<u32> {
        self.backups.lock().values().copied().max()
    }

    /// Runs `delete` with the files of `files` that no open backup
    /// includes, keeping new backups from starting meanwhile.
    pub fn with_unpinned<T>(&self, files: &[u32], delete: impl FnOnce(&[u32]) -> T) -> T {
        let backups = self.backups.lock();
        let horizon = backups.values().copied().max();
        let unpinned: Vec<u32> = files
            .iter()
            .copied()
            .filter(|&f| horizon.is_none_or(|h| f > h))
            .collect();
        if unpinned.len() < files.len() {
            debug!(
                pinned = files.len() - unpinned.len(),
                "cleaned files kept for an open backup"
            );
        }
        delete(&unpinned)
    }

    /// True when the log grew by at least `interval` bytes since the last
    /// run.
    pub fn bytes_interval_elapsed(&self, log_bytes: u64, interval: u64) -> bool {
        log_bytes.saturating_sub(self.last_run_bytes.load(Ordering::Relaxed)) >= interval
    }

    pub fn stats(&self, clear: bool) -> CleanerStats {
        let load = |c: &AtomicU64| {
            if clear {
                c.swap(0, Ordering::Relaxed)
            } else {
                c.load(Ordering::Relaxed)
            }
        };
        let backlog = {
            let states = self.states.lock();
            (states.cleaned.len() + states.checkpointed.len()) as u64
        };
        let c = &self.counters;
        CleanerStats {
            runs: load(&c.runs),
            files_cleaned: load(&c.files_cleaned),
            files_deleted: load(&c.files_deleted),
            files_deferred: load(&c.files_deferred),
            lns_migrated: load(&c.lns_migrated),
            lns_obsolete: load(&c.lns_obsolete),
            lns_locked: load(&c.lns_locked),
            ins_dirtied: load(&c.ins_dirtied),
            ins_obsolete: load(&c.ins_obsolete),
            backlog,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Runs
// ------------------------------------------------------------------------------------------------

/// Cleans log files until none qualifies, or after one file unless
/// `multiple` is set. With `force`, the least utilized eligible file is
/// cleaned even when utilization is above the thresholds. Returns the
/// number of files cleaned.
///
/// # Errors
///
/// `ReadOnly` in a read-only environment, or the first log or tree error.
pub(crate) fn clean_log(env: &EnvironmentImpl, multiple: bool, force: bool) -> Result<u32, Error> {
    env.check_writable()?;
    let cleaner = &env.cleaner;
    let _running = cleaner.run_lock.lock();
    cleaner.counters.runs.fetch_add(1, Ordering::Relaxed);

    let mut cleaned = 0u32;
    let mut deferred = BTreeSet::new();
    loop {
        let Some(file) = selector::select(env, force && cleaned == 0, &deferred) else {
            break;
        };
        cleaner.claim(file)?;
        let outcome = match processor::process_file(env, file) {
            Ok(outcome) => outcome,
            Err(e) => {
                cleaner.finish(file, false);
                return Err(e);
            }
        };
        match outcome {
            FileOutcome::Cleaned(run) => {
                cleaner.finish(file, true);
                cleaner.counters.files_cleaned.fetch_add(1, Ordering::Relaxed);
                cleaned += 1;
                info!(
                    file,
                    migrated = run.migrated,
                    obsolete = run.obsolete,
                    dirtied = run.dirtied,
                    "log file cleaned"
                );
            }
            FileOutcome::Deferred { locked } => {
                cleaner.finish(file, false);
                cleaner.counters.files_deferred.fetch_add(1, Ordering::Relaxed);
                deferred.insert(file);
                warn!(file, locked, "log file deferred, records still locked");
            }
        }
        if !multiple {
            break;
        }
    }
    cleaner
        .last_run_bytes
        .store(env.log.bytes_written(), Ordering::Relaxed);
    debug!(cleaned, deferred = deferred.len(), "cleaner run finished");
    Ok(cleaned)
}
