//! Lockers and transactions.
//!
//! A [`Locker`] owns a set of locks in the [`LockManager`]. Transactions,
//! database handles and the short-lived lockers of non-transactional
//! operations are all lockers.
//!
//! A [`Txn`] adds what commit and abort need: the chain of LN entries it
//! logged, an undo record per slot it modified, the entries that become
//! obsolete if it commits, and the database-level actions to finish at
//! commit or abort. The [`TxnManager`] hands out transaction ids and knows
//! the first LSN of every active transaction, which bounds both recovery
//! and the set of files the cleaner may touch.

#[cfg(test)]
mod tests;

pub(crate) mod lock;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::cleaner::Obsolete;
use crate::config::TransactionConfig;
use crate::log::Lsn;
use crate::{DatabaseId, TxnId};

use lock::{LockError, LockGrant, LockId, LockManager, LockType, LockerId};

// ------------------------------------------------------------------------------------------------
// Locker
// ------------------------------------------------------------------------------------------------

/// An owner of locks.
pub(crate) struct Locker {
    id: LockerId,
    manager: Arc<LockManager>,
    held: Mutex<HashMap<LockId, LockType>>,
    timeout: Duration,
    no_wait: bool,
}

impl Locker {
    pub fn new(manager: Arc<LockManager>, timeout: Duration, no_wait: bool) -> Self {
        Self {
            id: manager.new_locker(),
            manager,
            held: Mutex::new(HashMap::new()),
            timeout,
            no_wait,
        }
    }

    pub fn id(&self) -> LockerId {
        self.id
    }

    /// Acquires a lock, waiting unless the locker is non-waiting.
    pub fn lock(&self, id: LockId, ty: LockType) -> Result<LockGrant, LockError> {
        let grant = self
            .manager
            .lock(self.id, id, ty, self.no_wait, self.timeout)?;
        if grant == LockGrant::Denied {
            return Err(LockError::NotGranted {
                locker: self.id,
                lock: id.to_string(),
                ty,
            });
        }
        self.record(id, ty, grant);
        Ok(grant)
    }

    /// Acquires a lock only if no other locker conflicts.
    pub fn try_lock(&self, id: LockId, ty: LockType) -> Result<LockGrant, LockError> {
        let grant = self.manager.lock(self.id, id, ty, true, self.timeout)?;
        self.record(id, ty, grant);
        Ok(grant)
    }

    /// Acquires a lock with an explicit timeout.
    pub fn lock_with_timeout(
        &self,
        id: LockId,
        ty: LockType,
        timeout: Duration,
    ) -> Result<LockGrant, LockError> {
        let grant = self.manager.lock(self.id, id, ty, false, timeout)?;
        self.record(id, ty, grant);
        Ok(grant)
    }

    fn record(&self, id: LockId, ty: LockType, grant: LockGrant) {
        match grant {
            LockGrant::New => {
                self.held.lock().insert(id, ty);
            }
            LockGrant::Upgraded => {
                let mut held = self.held.lock();
                let current = held.get(&id).copied().unwrap_or(ty);
                held.insert(id, current.upgrade(ty));
            }
            LockGrant::Existing | LockGrant::Denied => {}
        }
    }

    pub fn release(&self, id: LockId) -> bool {
        self.held.lock().remove(&id);
        self.manager.release(self.id, id)
    }

    /// Releases every lock.
    pub fn release_all(&self) {
        let held: Vec<LockId> = self.held.lock().drain().map(|(id, _)| id).collect();
        for id in held {
            self.manager.release(self.id, id);
        }
    }

    pub fn holds(&self, id: LockId) -> Option<LockType> {
        self.held.lock().get(&id).copied()
    }

    /// Number of read and write locks held.
    pub fn lock_counts(&self) -> (usize, usize) {
        let held = self.held.lock();
        let writes = held.values().filter(|t| t.is_write()).count();
        let reads = held
            .values()
            .filter(|t| !t.is_write() && **t != LockType::RangeInsert)
            .count();
        (reads, writes)
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.release_all();
    }
}

// ------------------------------------------------------------------------------------------------
// Undo records
// ------------------------------------------------------------------------------------------------

/// Slot a transaction modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UndoTarget {
    /// A record; `main_key` is set for a duplicate inside a subtree, and
    /// `key` is then the duplicate's data.
    Record {
        main_key: Option<Vec<u8>>,
        key: Vec<u8>,
    },
    /// The count of a duplicate subtree.
    DupCount { main_key: Vec<u8>, old_count: u64 },
}

/// What abort needs to restore one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoRecord {
    pub db_id: DatabaseId,
    pub target: UndoTarget,
    pub ln_id: u64,
    /// The entry this transaction logged.
    pub lsn: Lsn,
    pub size: u32,
    pub abort_lsn: Lsn,
    pub abort_deleted: bool,
    /// Key bytes the slot held before, when the write changed them.
    pub abort_key: Option<Vec<u8>>,
    /// Cached data the slot held before.
    pub abort_data: Option<Vec<u8>>,
}

/// Database-level work finished when the transaction ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbAction {
    /// Delete the database's records and mapping if the transaction
    /// commits (remove, or the old id of a truncate).
    DeleteOnCommit(DatabaseId),
    /// Delete the database if the transaction aborts (create, or the new id
    /// of a truncate).
    DeleteOnAbort(DatabaseId),
}

// ------------------------------------------------------------------------------------------------
// Transactions
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnStatus {
    Open,
    /// An operation failed in a way that leaves only abort.
    MustAbort,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct TxnState {
    pub status: TxnStatus,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub undo: Vec<UndoRecord>,
    /// Entries that become obsolete if the transaction commits.
    pub obsolete_on_commit: Vec<Obsolete>,
    pub db_actions: Vec<DbAction>,
    /// Open cursors; commit and abort require none.
    pub cursors: usize,
}

/// A transaction.
pub(crate) struct Txn {
    pub id: TxnId,
    pub locker: Locker,
    pub config: TransactionConfig,
    /// Set for the implicit transaction of a single operation.
    pub auto_commit: bool,
    state: Mutex<TxnState>,
}

impl Txn {
    pub fn state(&self) -> parking_lot::MutexGuard<'_, TxnState> {
        self.state.lock()
    }

    pub fn status(&self) -> TxnStatus {
        self.state.lock().status
    }

    /// Records an entry logged by this transaction.
    pub fn logged(&self, lsn: Lsn) {
        let mut state = self.state.lock();
        if state.first_lsn.is_null() {
            state.first_lsn = lsn;
        }
        state.last_lsn = lsn;
    }

    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().last_lsn
    }

    pub fn first_lsn(&self) -> Lsn {
        self.state.lock().first_lsn
    }

    pub fn push_undo(&self, record: UndoRecord) {
        self.state.lock().undo.push(record);
    }

    pub fn obsolete_on_commit(&self, obsolete: Obsolete) {
        self.state.lock().obsolete_on_commit.push(obsolete);
    }

    pub fn push_db_action(&self, action: DbAction) {
        self.state.lock().db_actions.push(action);
    }

    pub fn set_must_abort(&self) {
        let mut state = self.state.lock();
        if state.status == TxnStatus::Open {
            state.status = TxnStatus::MustAbort;
        }
    }

    pub fn is_serializable(&self) -> bool {
        self.config.serializable
    }
}

// ------------------------------------------------------------------------------------------------
// Transaction manager
// ------------------------------------------------------------------------------------------------

/// Transaction statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnStats {
    pub begins: u64,
    pub commits: u64,
    pub aborts: u64,
    pub active: u64,
}

#[derive(Debug, Default)]
struct TxnCounters {
    begins: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

pub(crate) struct TxnManager {
    locks: Arc<LockManager>,
    next_id: AtomicU64,
    active: Mutex<BTreeMap<TxnId, Arc<Txn>>>,
    lock_timeout: Duration,
    counters: TxnCounters,
}

impl TxnManager {
    pub fn new(locks: Arc<LockManager>, lock_timeout: Duration) -> Self {
        Self {
            locks,
            next_id: AtomicU64::new(1),
            active: Mutex::new(BTreeMap::new()),
            lock_timeout,
            counters: TxnCounters::default(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// A locker for work outside any transaction.
    pub fn basic_locker(&self) -> Locker {
        Locker::new(Arc::clone(&self.locks), self.lock_timeout, false)
    }

    pub fn begin(&self, config: TransactionConfig, auto_commit: bool) -> Arc<Txn> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = config.lock_timeout.unwrap_or(self.lock_timeout);
        let txn = Arc::new(Txn {
            id,
            locker: Locker::new(Arc::clone(&self.locks), timeout, config.no_wait),
            config,
            auto_commit,
            state: Mutex::new(TxnState {
                status: TxnStatus::Open,
                first_lsn: Lsn::NULL,
                last_lsn: Lsn::NULL,
                undo: Vec::new(),
                obsolete_on_commit: Vec::new(),
                db_actions: Vec::new(),
                cursors: 0,
            }),
        });
        self.active.lock().insert(id, Arc::clone(&txn));
        self.counters.begins.fetch_add(1, Ordering::Relaxed);
        if !auto_commit {
            debug!(txn = id, "transaction started");
        }
        txn
    }

    /// Unregisters an ended transaction.
    pub fn finish(&self, txn: &Txn, committed: bool) {
        self.active.lock().remove(&txn.id);
        let counter = if committed {
            &self.counters.commits
        } else {
            &self.counters.aborts
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Smallest first LSN of the active transactions, or null.
    pub fn first_active_lsn(&self) -> Lsn {
        self.active
            .lock()
            .values()
            .map(|t| t.first_lsn())
            .filter(|l| !l.is_null())
            .min()
            .unwrap_or(Lsn::NULL)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn last_id(&self) -> TxnId {
        self.next_id.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Ensures future ids are greater than `seen`.
    pub fn advance_ids(&self, seen: TxnId) {
        self.next_id.fetch_max(seen + 1, Ordering::Relaxed);
    }

    pub fn stats(&self, clear: bool) -> TxnStats {
        let load = |c: &AtomicU64| {
            if clear {
                c.swap(0, Ordering::Relaxed)
            } else {
                c.load(Ordering::Relaxed)
            }
        };
        TxnStats {
            begins: load(&self.counters.begins),
            commits: load(&self.counters.commits),
            aborts: load(&self.counters.aborts),
            active: self.active_count() as u64,
        }
    }
}
