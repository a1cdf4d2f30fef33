//! Record and database locks.
//!
//! Locks are owned by lockers (transactions, cursors of non-transactional
//! databases, database handles) and live in a table split into
//! `lock_tables` buckets, each a mutex-protected map with its own condition
//! variable. A request that conflicts with another owner waits on the
//! bucket's condition variable until the owners change or the lock timeout
//! expires.
//!
//! Every waiting locker records which lockers block it. Before waiting, the
//! requester looks for a cycle through itself in that waits-for graph and
//! fails with [`LockError::Deadlock`] if one exists; the requester is the
//! victim, never some other transaction. A timeout fails with
//! [`LockError::Timeout`].
//!
//! ## Lock types
//!
//! | held \ requested | Read | Write | RangeRead | RangeWrite | RangeInsert |
//! |------------------|------|-------|-----------|------------|-------------|
//! | Read             | ok   | -     | ok        | -          | ok          |
//! | Write            | -    | -     | -         | -          | ok          |
//! | RangeRead        | ok   | -     | ok        | -          | -           |
//! | RangeWrite       | -    | -     | -         | -          | -           |
//! | RangeInsert      | ok   | ok    | ok        | ok         | ok          |
//!
//! Range locks protect the gap before a record (or before the end of a
//! database, through its EOF lock) for serializable isolation; an insert
//! tests the gap with a RangeInsert lock on the record that follows.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, trace};

use crate::DatabaseId;

/// Owner of locks.
pub(crate) type LockerId = u64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LockError {
    /// Waiting would close a cycle of waiting lockers.
    #[error("deadlock: locker {locker} requesting {ty:?} on {lock} would wait for {blockers:?}")]
    Deadlock {
        locker: u64,
        lock: String,
        ty: LockType,
        blockers: Vec<u64>,
    },

    /// The lock was not granted before the timeout.
    #[error("lock timeout after {timeout:?}: locker {locker} requesting {ty:?} on {lock}, held by {owners:?}")]
    Timeout {
        locker: u64,
        lock: String,
        ty: LockType,
        timeout: Duration,
        owners: Vec<u64>,
    },

    /// A non-waiting locker met a conflicting lock.
    #[error("lock not granted: locker {locker} requesting {ty:?} on {lock}")]
    NotGranted { locker: u64, lock: String, ty: LockType },
}

// ------------------------------------------------------------------------------------------------
// Lock identity and types
// ------------------------------------------------------------------------------------------------

/// Lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum LockId {
    /// A record slot, by record id.
    Record(u64),
    /// A database, for handle locks and structural operations.
    Database(DatabaseId),
    /// The gap after the last record of a database.
    Eof(DatabaseId),
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockId::Record(id) => write!(f, "record {id}"),
            LockId::Database(id) => write!(f, "database {id}"),
            LockId::Eof(id) => write!(f, "eof of database {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    Read,
    Write,
    RangeRead,
    RangeWrite,
    RangeInsert,
}

impl LockType {
    pub fn is_write(self) -> bool {
        matches!(self, LockType::Write | LockType::RangeWrite)
    }

    pub fn is_range(self) -> bool {
        matches!(self, LockType::RangeRead | LockType::RangeWrite)
    }

    /// Whether a request of type `requested` conflicts with `self` held by
    /// another locker.
    pub fn conflicts(self, requested: LockType) -> bool {
        use LockType::*;
        match (self, requested) {
            (RangeInsert, _) => false,
            (Read, Read | RangeRead | RangeInsert) => false,
            (Write, RangeInsert) => false,
            (RangeRead, Read | RangeRead) => false,
            _ => true,
        }
    }

    /// Type held after `self` is upgraded by a request for `requested`.
    pub fn upgrade(self, requested: LockType) -> LockType {
        if self == requested || requested == LockType::RangeInsert {
            return self;
        }
        if self == LockType::RangeInsert {
            return requested;
        }
        let write = self.is_write() || requested.is_write();
        let range = self.is_range() || requested.is_range();
        match (write, range) {
            (false, false) => LockType::Read,
            (true, false) => LockType::Write,
            (false, true) => LockType::RangeRead,
            (true, true) => LockType::RangeWrite,
        }
    }
}

/// Outcome of a granted (or refused, when not waiting) request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockGrant {
    /// The locker did not hold the lock before.
    New,
    /// The locker already held a lock at least as strong.
    Existing,
    /// The locker's lock was strengthened.
    Upgraded,
    /// A non-waiting request conflicted.
    Denied,
}

// ------------------------------------------------------------------------------------------------
// Statistics
// ------------------------------------------------------------------------------------------------

/// Lock table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub read_locks: u64,
    pub write_locks: u64,
    pub owners: u64,
    pub waiters: u64,
    pub requests: u64,
    pub waits: u64,
    pub deadlocks: u64,
    pub timeouts: u64,
    pub denied: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    waits: AtomicU64,
    deadlocks: AtomicU64,
    timeouts: AtomicU64,
    denied: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// Lock manager
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LockEntry {
    owners: Vec<(LockerId, LockType)>,
    waiters: usize,
}

#[derive(Debug, Default)]
struct Table {
    locks: Mutex<HashMap<LockId, LockEntry>>,
    changed: Condvar,
}

#[derive(Debug)]
struct Wait {
    lock: LockId,
    ty: LockType,
    blockers: Vec<LockerId>,
}

/// Lock table of one environment.
pub(crate) struct LockManager {
    tables: Vec<Table>,
    waits_for: Mutex<HashMap<LockerId, Wait>>,
    next_locker: AtomicU64,
    counters: Counters,
}

impl LockManager {
    pub fn new(n_tables: usize) -> Self {
        Self {
            tables: (0..n_tables.max(1)).map(|_| Table::default()).collect(),
            waits_for: Mutex::new(HashMap::new()),
            next_locker: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Allocates a locker id.
    pub fn new_locker(&self) -> LockerId {
        self.next_locker.fetch_add(1, Ordering::Relaxed)
    }

    fn table(&self, id: LockId) -> &Table {
        let raw = match id {
            LockId::Record(n) => n.wrapping_mul(3),
            LockId::Database(n) => n.wrapping_mul(3) + 1,
            LockId::Eof(n) => n.wrapping_mul(3) + 2,
        };
        &self.tables[(raw % self.tables.len() as u64) as usize]
    }

    /// Requests a lock. With `no_wait` a conflict returns
    /// [`LockGrant::Denied`] instead of waiting.
    pub fn lock(
        &self,
        locker: LockerId,
        id: LockId,
        ty: LockType,
        no_wait: bool,
        timeout: Duration,
    ) -> Result<LockGrant, LockError> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let table = self.table(id);
        let deadline = Instant::now() + timeout;
        let mut locks = table.locks.lock();
        let mut expired = false;

        loop {
            let entry = locks.entry(id).or_default();
            let mine = entry.owners.iter().position(|(l, _)| *l == locker);
            let target = match mine {
                Some(i) => entry.owners[i].1.upgrade(ty),
                None => ty,
            };
            let check = if ty == LockType::RangeInsert { ty } else { target };
            let blockers: Vec<LockerId> = entry
                .owners
                .iter()
                .filter(|(l, held)| *l != locker && held.conflicts(check))
                .map(|(l, _)| *l)
                .collect();

            if blockers.is_empty() {
                let grant = match mine {
                    Some(i) if entry.owners[i].1 == target => LockGrant::Existing,
                    Some(_) if ty == LockType::RangeInsert => LockGrant::Existing,
                    Some(i) => {
                        entry.owners[i].1 = target;
                        LockGrant::Upgraded
                    }
                    None => {
                        entry.owners.push((locker, ty));
                        LockGrant::New
                    }
                };
                let has_waiters = entry.waiters > 0;
                let mut waits = self.waits_for.lock();
                waits.remove(&locker);
                if has_waiters && grant != LockGrant::Existing {
                    for wait in waits.values_mut() {
                        if wait.lock == id && target.conflicts(wait.ty) && !wait.blockers.contains(&locker) {
                            wait.blockers.push(locker);
                        }
                    }
                }
                trace!(locker, lock = %id, ?ty, ?grant, "lock granted");
                return Ok(grant);
            }

            if no_wait {
                if mine.is_none() && entry.owners.is_empty() && entry.waiters == 0 {
                    locks.remove(&id);
                }
                self.counters.denied.fetch_add(1, Ordering::Relaxed);
                return Ok(LockGrant::Denied);
            }

            if expired {
                self.waits_for.lock().remove(&locker);
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(locker, lock = %id, ?ty, ?blockers, "lock timeout");
                return Err(LockError::Timeout {
                    locker,
                    lock: id.to_string(),
                    ty,
                    timeout,
                    owners: blockers,
                });
            }

            {
                let mut waits = self.waits_for.lock();
                waits.insert(
                    locker,
                    Wait {
                        lock: id,
                        ty: check,
                        blockers: blockers.clone(),
                    },
                );
                if has_cycle(&waits, locker) {
                    waits.remove(&locker);
                    self.counters.deadlocks.fetch_add(1, Ordering::Relaxed);
                    debug!(locker, lock = %id, ?ty, ?blockers, "deadlock detected");
                    return Err(LockError::Deadlock {
                        locker,
                        lock: id.to_string(),
                        ty,
                        blockers,
                    });
                }
            }

            entry.waiters += 1;
            self.counters.waits.fetch_add(1, Ordering::Relaxed);
            trace!(locker, lock = %id, ?ty, ?blockers, "waiting for lock");
            expired = table.changed.wait_until(&mut locks, deadline).timed_out();
            if let Some(entry) = locks.get_mut(&id) {
                entry.waiters -= 1;
            }
        }
    }

    /// Releases `locker`'s lock on `id`. Returns whether it was held.
    pub fn release(&self, locker: LockerId, id: LockId) -> bool {
        let table = self.table(id);
        let mut locks = table.locks.lock();
        let Some(entry) = locks.get_mut(&id) else {
            return false;
        };
        let Some(pos) = entry.owners.iter().position(|(l, _)| *l == locker) else {
            return false;
        };
        entry.owners.remove(pos);
        let has_waiters = entry.waiters > 0;
        if entry.owners.is_empty() && !has_waiters {
            locks.remove(&id);
        }
        if has_waiters {
            let mut waits = self.waits_for.lock();
            for wait in waits.values_mut() {
                if wait.lock == id {
                    wait.blockers.retain(|l| *l != locker);
                }
            }
            drop(waits);
            table.changed.notify_all();
        }
        trace!(locker, lock = %id, "lock released");
        true
    }

    /// Type of the lock `locker` holds on `id`.
    pub fn held_by(&self, locker: LockerId, id: LockId) -> Option<LockType> {
        let locks = self.table(id).locks.lock();
        locks
            .get(&id)?
            .owners
            .iter()
            .find(|(l, _)| *l == locker)
            .map(|(_, t)| *t)
    }

    /// Lockers owning `id`.
    pub fn owners(&self, id: LockId) -> Vec<(LockerId, LockType)> {
        let locks = self.table(id).locks.lock();
        locks.get(&id).map(|e| e.owners.clone()).unwrap_or_default()
    }

    pub fn stats(&self, clear: bool) -> LockStats {
        let mut stats = LockStats::default();
        for table in &self.tables {
            let locks = table.locks.lock();
            for entry in locks.values() {
                stats.owners += entry.owners.len() as u64;
                stats.waiters += entry.waiters as u64;
                for (_, ty) in &entry.owners {
                    if ty.is_write() {
                        stats.write_locks += 1;
                    } else if *ty != LockType::RangeInsert {
                        stats.read_locks += 1;
                    }
                }
            }
        }
        let load = |c: &AtomicU64| {
            if clear {
                c.swap(0, Ordering::Relaxed)
            } else {
                c.load(Ordering::Relaxed)
            }
        };
        stats.requests = load(&self.counters.requests);
        stats.waits = load(&self.counters.waits);
        stats.deadlocks = load(&self.counters.deadlocks);
        stats.timeouts = load(&self.counters.timeouts);
        stats.denied = load(&self.counters.denied);
        stats
    }
}

/// Depth-first search for a path of waits leading back to `start`.
fn has_cycle(waits: &HashMap<LockerId, Wait>, start: LockerId) -> bool {
    let mut stack: Vec<LockerId> = waits
        .get(&start)
        .map(|w| w.blockers.clone())
        .unwrap_or_default();
    let mut seen = HashSet::new();
    while let Some(locker) = stack.pop() {
        if locker == start {
            return true;
        }
        if !seen.insert(locker) {
            continue;
        }
        if let Some(wait) = waits.get(&locker) {
            stack.extend(wait.blockers.iter().copied());
        }
    }
    false
}
