//! Cursor engine behind [`Cursor`](crate::Cursor) and the single-record
//! operations of [`Database`](crate::Database).
//!
//! A cursor position is a record id plus the key that leads to it. Every
//! move first finds a slot under latches, then locks the record id with no
//! latch held, then repeats the same search: the position stands only when
//! the repeated search lands on the locked record. Deleted slots are locked
//! too, because the deleter may still abort; they are skipped once the lock
//! is held.
//!
//! Writes lock before they latch. The closure passed to [`Tree::modify`]
//! re-checks that the slot still holds the expected record id and asks for
//! a retry otherwise; it never blocks on a lock.
//!
//! [`Tree::modify`]: crate::tree::Tree::modify

use std::sync::Arc;

use crate::config::TransactionConfig;
use crate::log::entry::{LnEntry, LnKind, LogEntry};
use crate::log::{LogError, Lsn};
use crate::record::{DatabaseEntry, LockMode, OperationStatus};
use crate::tree::node::{DupCount, Slot, Target};
use crate::tree::{LeafEdit, Scope, Seek, SlotView};
use crate::txn::lock::{LockGrant, LockId, LockType};
use crate::txn::{Locker, Txn, TxnStatus, UndoTarget};
use crate::Error;

use super::dbtree::DbRef;
use super::{EnvironmentImpl, Prior, WriteLocker, evictor};

/// Key and data of the record a cursor landed on.
pub(crate) type Record = crate::KeyValue;

/// Lock owner of a cursor.
pub(crate) enum CursorLocker {
    Txn(Arc<Txn>),
    /// No transaction on a transactional database: reads lock for the
    /// duration of one call, writes run in their own transaction.
    AutoCommit(Locker),
    /// Non-transactional database: locks last for one call.
    NonTxn(Locker),
}

/// Isolation of a cursor, from its transaction and its own configuration.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Isolation {
    pub serializable: bool,
    pub read_committed: bool,
    pub read_uncommitted: bool,
}

impl Isolation {
    pub fn of_txn(config: &TransactionConfig) -> Self {
        Self {
            serializable: config.serializable,
            read_committed: config.read_committed,
            read_uncommitted: config.read_uncommitted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PutMode {
    Overwrite,
    NoOverwrite,
    NoDupData,
}

#[derive(Debug, Clone)]
struct Position {
    key: Vec<u8>,
    /// Duplicate data, in a database with sorted duplicates.
    dup: Option<Vec<u8>>,
    ln_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct Held {
    id: LockId,
    grant: LockGrant,
    ty: LockType,
}

struct Found {
    view: SlotView,
    lock: Option<Held>,
}

enum Attempt<T> {
    Done(T),
    Retry,
}

/// Owned form of [`Seek`], for loops that advance their own bound.
#[derive(Debug, Clone)]
enum Step {
    First,
    Last,
    Ge(Vec<u8>),
    Gt(Vec<u8>),
    Lt(Vec<u8>),
}

impl Step {
    fn as_seek(&self) -> Seek<'_> {
        match self {
            Step::First => Seek::First,
            Step::Last => Seek::Last,
            Step::Ge(k) => Seek::Ge(k),
            Step::Gt(k) => Seek::Gt(k),
            Step::Lt(k) => Seek::Lt(k),
        }
    }

    fn forward(&self) -> bool {
        !matches!(self, Step::Last | Step::Lt(_))
    }

    fn past(forward: bool, key: Vec<u8>) -> Self {
        if forward { Step::Gt(key) } else { Step::Lt(key) }
    }
}

fn range_of(ty: LockType) -> LockType {
    if ty.is_write() {
        LockType::RangeWrite
    } else {
        LockType::RangeRead
    }
}

fn not_positioned() -> Error {
    Error::InvalidArgument("cursor is not positioned".into())
}

fn corrupt(msg: &str) -> Error {
    Error::RunRecovery(msg.to_string())
}

// ------------------------------------------------------------------------------------------------
// CursorImpl
// ------------------------------------------------------------------------------------------------

pub(crate) struct CursorImpl<'e> {
    env: &'e EnvironmentImpl,
    db: DbRef,
    locker: CursorLocker,
    iso: Isolation,
    pos: Option<Position>,
    held: Option<Held>,
}

impl<'e> CursorImpl<'e> {
    pub fn new(env: &'e EnvironmentImpl, db: DbRef, locker: CursorLocker, iso: Isolation) -> Self {
        Self {
            env,
            db,
            locker,
            iso,
            pos: None,
            held: None,
        }
    }

    pub fn db(&self) -> &DbRef {
        &self.db
    }

    pub fn is_positioned(&self) -> bool {
        self.pos.is_some()
    }

    /// A new cursor on the same database and locker, at the same position
    /// when `same_position` is set.
    pub fn duplicate(&self, same_position: bool) -> CursorImpl<'e> {
        let locker = match &self.locker {
            CursorLocker::Txn(txn) => CursorLocker::Txn(Arc::clone(txn)),
            CursorLocker::AutoCommit(_) => CursorLocker::AutoCommit(self.env.txns.basic_locker()),
            CursorLocker::NonTxn(_) => CursorLocker::NonTxn(self.env.txns.basic_locker()),
        };
        CursorImpl {
            env: self.env,
            db: Arc::clone(&self.db),
            locker,
            iso: self.iso,
            pos: if same_position { self.pos.clone() } else { None },
            held: None,
        }
    }

    pub fn close(&mut self) {
        if !matches!(self.locker, CursorLocker::Txn(_)) {
            self.locker().release_all();
        }
        self.pos = None;
        self.held = None;
    }

    fn locker(&self) -> &Locker {
        match &self.locker {
            CursorLocker::Txn(txn) => &txn.locker,
            CursorLocker::AutoCommit(locker) | CursorLocker::NonTxn(locker) => locker,
        }
    }

    fn dups(&self) -> bool {
        self.db.sorted_duplicates
    }

    // --------------------------------------------------------------------------------------------
    // Operation framing
    // --------------------------------------------------------------------------------------------

    fn op<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, Error>) -> Result<T, Error> {
        self.env.check_usable()?;
        if self.db.is_deleted() {
            return Err(Error::DatabaseNotFound(format!("database {} was removed", self.db.id)));
        }
        if let CursorLocker::Txn(txn) = &self.locker {
            if matches!(txn.status(), TxnStatus::Committed | TxnStatus::Aborted) {
                return Err(Error::InvalidArgument(format!(
                    "transaction {} has already ended",
                    txn.id
                )));
            }
        }
        let result = f(self);
        if !matches!(self.locker, CursorLocker::Txn(_)) {
            self.locker().release_all();
            self.held = None;
        }
        self.env.guard(result)
    }

    /// Runs a write for the cursor's locker; an auto-commit cursor gets a
    /// transaction of its own.
    fn write<T>(&self, f: impl FnOnce(&Self, WriteLocker<'_>) -> Result<T, Error>) -> Result<T, Error> {
        self.env.check_writable()?;
        let result = match &self.locker {
            CursorLocker::Txn(txn) => {
                if txn.status() != TxnStatus::Open {
                    return Err(Error::InvalidArgument(format!(
                        "transaction {} must be aborted",
                        txn.id
                    )));
                }
                let result = f(self, WriteLocker::Txn(txn));
                if let Err(Error::Io(_) | Error::RunRecovery(_) | Error::Checksum(_)) = &result {
                    txn.set_must_abort();
                }
                result
            }
            CursorLocker::AutoCommit(_) => {
                let txn = self.env.txns.begin(TransactionConfig::default(), true);
                match f(self, WriteLocker::Txn(&txn)) {
                    Ok(value) => {
                        self.env.commit(&txn)?;
                        Ok(value)
                    }
                    Err(e) => {
                        let _ = self.env.abort(&txn);
                        Err(e)
                    }
                }
            }
            CursorLocker::NonTxn(locker) => f(self, WriteLocker::NonTxn(locker)),
        };
        if result.is_ok() && self.env.cache.budget().over_budget() {
            evictor::evict_memory(self.env)?;
        }
        result
    }

    // --------------------------------------------------------------------------------------------
    // Locking
    // --------------------------------------------------------------------------------------------

    fn read_lock(&self, mode: LockMode) -> Option<LockType> {
        match mode {
            LockMode::ReadUncommitted => None,
            LockMode::Rmw if self.iso.serializable => Some(LockType::RangeWrite),
            LockMode::Rmw => Some(LockType::Write),
            _ if self.iso.read_uncommitted => None,
            _ if self.iso.serializable => Some(LockType::RangeRead),
            _ => Some(LockType::Read),
        }
    }

    fn release_if_new(&self, held: Held) {
        if held.grant == LockGrant::New {
            self.locker().release(held.id);
        }
    }

    fn drop_lock(&self, held: Option<Held>) {
        if let Some(held) = held {
            if !self.iso.serializable {
                self.release_if_new(held);
            }
        }
    }

    /// Locks the record after `key` (or the end of the database) against
    /// range readers before an insert.
    fn lock_insert_range(&self, locker: &Locker, scope: Scope<'_>, key: &[u8]) -> Result<Held, Error> {
        let id = match self.db.tree.seek(scope, Seek::Gt(key))? {
            Some(next) => LockId::Record(next.ln_id()),
            None => LockId::Eof(self.db.id),
        };
        let grant = locker.lock(id, LockType::RangeInsert)?;
        Ok(Held {
            id,
            grant,
            ty: LockType::RangeInsert,
        })
    }

    fn release_insert_range(&self, locker: &Locker, held: Held) {
        if held.grant == LockGrant::New {
            locker.release(held.id);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Locked search loops
    // --------------------------------------------------------------------------------------------

    /// Finds the first live record selected by `step` in `scope` and locks
    /// it. When `eof` is set, a serializable forward search that runs off
    /// the end locks the end of the database.
    fn lock_loop(
        &self,
        scope: Scope<'_>,
        mut step: Step,
        lock: Option<LockType>,
        eof: bool,
    ) -> Result<Option<Found>, Error> {
        let forward = step.forward();
        let mut held: Option<Held> = None;
        let mut eof_taken = false;
        loop {
            let Some(view) = self.db.tree.seek(scope, step.as_seek())? else {
                self.drop_lock(held.take());
                if let Some(ty) = lock {
                    if eof && forward && self.iso.serializable && !eof_taken {
                        self.locker().lock(LockId::Eof(self.db.id), range_of(ty))?;
                        eof_taken = true;
                        continue;
                    }
                }
                return Ok(None);
            };
            if let Some(ty) = lock {
                let id = LockId::Record(view.ln_id());
                if held.map(|h| h.id) != Some(id) {
                    self.drop_lock(held.take());
                    let grant = self.locker().lock(id, ty)?;
                    held = Some(Held { id, grant, ty });
                    continue;
                }
            }
            if view.is_deleted() {
                self.drop_lock(held.take());
                step = Step::past(forward, view.key);
                continue;
            }
            return Ok(Some(Found { view, lock: held }));
        }
    }

    /// Moves across main keys of a database with duplicates, landing on the
    /// first (or, backwards, last) live duplicate of the first main key
    /// that has one.
    fn main_move(&self, mut step: Step, lock: Option<LockType>) -> Result<Option<(Vec<u8>, Found)>, Error> {
        let forward = step.forward();
        let mut eof_taken = false;
        loop {
            let Some(main) = self.db.tree.seek(Scope::Main, step.as_seek())? else {
                if let Some(ty) = lock {
                    if forward && self.iso.serializable && !eof_taken {
                        self.locker().lock(LockId::Eof(self.db.id), range_of(ty))?;
                        eof_taken = true;
                        continue;
                    }
                }
                return Ok(None);
            };
            if main.is_dup_tree() {
                let inner = if forward { Step::First } else { Step::Last };
                if let Some(found) = self.lock_loop(Scope::Dup(&main.key), inner, lock, false)? {
                    return Ok(Some((main.key, found)));
                }
            }
            step = Step::past(forward, main.key);
        }
    }

    /// Data of a record slot; `None` if the record disappeared meanwhile.
    fn read_data(&self, scope: Scope<'_>, view: &SlotView) -> Result<Option<Vec<u8>>, Error> {
        let mut view = view.clone();
        for _ in 0..3 {
            if let crate::tree::ViewTarget::Record { data: Some(data), .. } = &view.target {
                return Ok(Some(data.clone()));
            }
            match self.env.log.read_entry(view.lsn) {
                Ok(LogEntry::Ln(ln)) => return Ok(Some(ln.data)),
                Ok(_) => return Err(corrupt("record slot points at a non-record entry")),
                Err(LogError::FileNotFound(_)) => {
                    // The cleaner moved the record and deleted its old file.
                    let ln_id = view.ln_id();
                    match self.db.tree.get(scope, &view.key)? {
                        Some(again) if again.ln_id() == ln_id && !again.is_deleted() => view = again,
                        _ => return Ok(None),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Makes `found` the cursor position and returns its key and data.
    fn land(&mut self, main: Option<Vec<u8>>, found: Found, mode: LockMode) -> Result<Option<Record>, Error> {
        let Found { view, lock } = found;
        let (key, dup, data) = match main {
            Some(main) => (main, Some(view.key.clone()), view.key.clone()),
            None => {
                let Some(data) = self.read_data(Scope::Main, &view)? else {
                    self.drop_lock(lock);
                    return Ok(None);
                };
                (view.key.clone(), None, data)
            }
        };
        let previous = self.held.take();
        self.pos = Some(Position {
            key: key.clone(),
            dup,
            ln_id: view.ln_id(),
        });
        self.held = lock;
        let txn = matches!(self.locker, CursorLocker::Txn(_));
        if txn && (self.iso.read_committed || mode == LockMode::ReadCommitted) {
            if let Some(prev) = previous {
                if !prev.ty.is_write() && Some(prev.id) != lock.map(|h| h.id) {
                    self.release_if_new(prev);
                }
            }
        }
        if txn && mode == LockMode::ReadCommitted {
            if let Some(now) = lock {
                if !now.ty.is_write() {
                    self.release_if_new(now);
                    self.held = None;
                }
            }
        }
        Ok(Some((key, data)))
    }

    fn land_main(&mut self, found: Option<Found>, mode: LockMode) -> Result<Option<Record>, Error> {
        match found {
            Some(found) => self.land(None, found, mode),
            None => Ok(None),
        }
    }

    fn land_dup(&mut self, found: Option<(Vec<u8>, Found)>, mode: LockMode) -> Result<Option<Record>, Error> {
        match found {
            Some((main, found)) => self.land(Some(main), found, mode),
            None => Ok(None),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Moves
    // --------------------------------------------------------------------------------------------

    pub fn first(&mut self, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| c.edge(true, mode))
    }

    pub fn last(&mut self, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| c.edge(false, mode))
    }

    fn edge(&mut self, forward: bool, mode: LockMode) -> Result<Option<Record>, Error> {
        let lock = self.read_lock(mode);
        let step = if forward { Step::First } else { Step::Last };
        if self.dups() {
            let found = self.main_move(step, lock)?;
            self.land_dup(found, mode)
        } else {
            let found = self.lock_loop(Scope::Main, step, lock, true)?;
            self.land_main(found, mode)
        }
    }

    pub fn next(&mut self, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| c.step(true, mode))
    }

    pub fn prev(&mut self, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| c.step(false, mode))
    }

    fn step(&mut self, forward: bool, mode: LockMode) -> Result<Option<Record>, Error> {
        let Some(pos) = self.pos.clone() else {
            return self.edge(forward, mode);
        };
        let lock = self.read_lock(mode);
        match pos.dup {
            None => {
                let found = self.lock_loop(Scope::Main, Step::past(forward, pos.key), lock, true)?;
                self.land_main(found, mode)
            }
            Some(dup) => {
                if let Some(found) = self.lock_loop(Scope::Dup(&pos.key), Step::past(forward, dup), lock, false)? {
                    return self.land(Some(pos.key), found, mode);
                }
                let found = self.main_move(Step::past(forward, pos.key), lock)?;
                self.land_dup(found, mode)
            }
        }
    }

    /// Next or previous duplicate of the current key.
    pub fn step_dup(&mut self, forward: bool, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| {
            let pos = c.pos.clone().ok_or_else(not_positioned)?;
            let Some(dup) = pos.dup else {
                return Ok(None);
            };
            let lock = c.read_lock(mode);
            let found = c.lock_loop(Scope::Dup(&pos.key), Step::past(forward, dup), lock, false)?;
            match found {
                Some(found) => c.land(Some(pos.key), found, mode),
                None => Ok(None),
            }
        })
    }

    /// First record of the next key, or last record of the previous key.
    pub fn step_no_dup(&mut self, forward: bool, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| {
            let Some(pos) = c.pos.clone() else {
                return c.edge(forward, mode);
            };
            let lock = c.read_lock(mode);
            if c.dups() {
                let found = c.main_move(Step::past(forward, pos.key), lock)?;
                c.land_dup(found, mode)
            } else {
                let found = c.lock_loop(Scope::Main, Step::past(forward, pos.key), lock, true)?;
                c.land_main(found, mode)
            }
        })
    }

    // --------------------------------------------------------------------------------------------
    // Searches
    // --------------------------------------------------------------------------------------------

    /// Exact key search.
    pub fn search_key(&mut self, key: &[u8], mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| {
            let lock = c.read_lock(mode);
            let cmp = c.db.tree.config().cmp.clone();
            if c.dups() {
                let Some((main, found)) = c.main_move(Step::Ge(key.to_vec()), lock)? else {
                    return Ok(None);
                };
                if !cmp.equal(&main, key)? {
                    c.drop_lock(found.lock);
                    return Ok(None);
                }
                c.land(Some(main), found, mode)
            } else {
                let Some(found) = c.lock_loop(Scope::Main, Step::Ge(key.to_vec()), lock, true)? else {
                    return Ok(None);
                };
                if !cmp.equal(&found.view.key, key)? {
                    c.drop_lock(found.lock);
                    return Ok(None);
                }
                c.land(None, found, mode)
            }
        })
    }

    /// Smallest key greater than or equal to `key`.
    pub fn search_key_range(&mut self, key: &[u8], mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| {
            let lock = c.read_lock(mode);
            if c.dups() {
                let found = c.main_move(Step::Ge(key.to_vec()), lock)?;
                c.land_dup(found, mode)
            } else {
                let found = c.lock_loop(Scope::Main, Step::Ge(key.to_vec()), lock, true)?;
                c.land_main(found, mode)
            }
        })
    }

    /// Exact key and data search. With `range`, the data of a database with
    /// duplicates need only be greater than or equal to `data`.
    pub fn search_both(&mut self, key: &[u8], data: &[u8], range: bool, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| {
            let lock = c.read_lock(mode);
            let dup_cmp = c.db.tree.config().dup_cmp.clone();
            if !c.dups() {
                let cmp = c.db.tree.config().cmp.clone();
                let Some(found) = c.lock_loop(Scope::Main, Step::Ge(key.to_vec()), lock, true)? else {
                    return Ok(None);
                };
                if !cmp.equal(&found.view.key, key)? {
                    c.drop_lock(found.lock);
                    return Ok(None);
                }
                match c.read_data(Scope::Main, &found.view)? {
                    Some(current) if dup_cmp.equal(&current, data)? => c.land(None, found, mode),
                    _ => {
                        c.drop_lock(found.lock);
                        Ok(None)
                    }
                }
            } else {
                let Some(main) = c.db.tree.get(Scope::Main, key)? else {
                    return Ok(None);
                };
                if !main.is_dup_tree() {
                    return Ok(None);
                }
                let Some(found) = c.lock_loop(Scope::Dup(&main.key), Step::Ge(data.to_vec()), lock, false)? else {
                    return Ok(None);
                };
                if !range && !dup_cmp.equal(&found.view.key, data)? {
                    c.drop_lock(found.lock);
                    return Ok(None);
                }
                c.land(Some(main.key), found, mode)
            }
        })
    }

    /// Record at the current position; `None` once it has been deleted.
    pub fn current(&mut self, mode: LockMode) -> Result<Option<Record>, Error> {
        self.op(|c| {
            let pos = c.pos.clone().ok_or_else(not_positioned)?;
            let (scope, slot_key) = match &pos.dup {
                Some(dup) => (Scope::Dup(&pos.key), dup.as_slice()),
                None => (Scope::Main, pos.key.as_slice()),
            };
            if let Some(ty) = c.read_lock(mode) {
                let id = LockId::Record(pos.ln_id);
                if c.held.map(|h| h.id) != Some(id) {
                    let grant = c.locker().lock(id, ty)?;
                    c.held = Some(Held { id, grant, ty });
                }
            }
            let Some(view) = c.db.tree.get(scope, slot_key)? else {
                return Ok(None);
            };
            if view.ln_id() != pos.ln_id || view.is_deleted() {
                return Ok(None);
            }
            if pos.dup.is_some() {
                return Ok(Some((pos.key, view.key)));
            }
            Ok(c.read_data(scope, &view)?.map(|data| (view.key, data)))
        })
    }

    /// Number of records under the current key.
    pub fn count(&mut self) -> Result<u64, Error> {
        self.op(|c| {
            let pos = c.pos.clone().ok_or_else(not_positioned)?;
            if pos.dup.is_none() {
                return Ok(1);
            }
            let read = |c: &Self| -> Result<Option<DupCount>, Error> {
                Ok(match c.db.tree.get(Scope::Main, &pos.key)? {
                    Some(SlotView {
                        target: crate::tree::ViewTarget::Dup(count),
                        ..
                    }) => Some(count),
                    _ => None,
                })
            };
            let Some(count) = read(c)? else {
                return Ok(0);
            };
            if let Some(ty) = c.read_lock(LockMode::Default) {
                c.locker().lock(LockId::Record(count.ln_id), ty)?;
            }
            Ok(read(c)?.map_or(0, |count| count.count))
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Stores a record and positions the cursor on it.
    pub fn put(&mut self, key: &[u8], data: &DatabaseEntry, mode: PutMode) -> Result<OperationStatus, Error> {
        self.op(|c| {
            let (status, pos) = if c.dups() {
                if data.partial().is_some() {
                    return Err(Error::InvalidArgument(
                        "partial data cannot be stored in a database with sorted duplicates".into(),
                    ));
                }
                c.write(|c, who| c.put_dup(who, key, data.data(), mode))?
            } else {
                if mode == PutMode::NoDupData {
                    return Err(Error::InvalidArgument(
                        "no-duplicate puts need a database with sorted duplicates".into(),
                    ));
                }
                c.write(|c, who| c.put_single(who, key, data, mode == PutMode::NoOverwrite))?
            };
            if let Some(pos) = pos {
                c.pos = Some(pos);
                c.held = None;
            }
            Ok(status)
        })
    }

    fn put_single(
        &self,
        who: WriteLocker<'_>,
        key: &[u8],
        data: &DatabaseEntry,
        no_overwrite: bool,
    ) -> Result<(OperationStatus, Option<Position>), Error> {
        let tree = &self.db.tree;
        loop {
            let existing = tree.get(Scope::Main, key)?;
            let mut range = None;
            match &existing {
                Some(view) if no_overwrite && !view.is_deleted() => {
                    who.locker().lock(LockId::Record(view.ln_id()), LockType::Read)?;
                    match tree.get(Scope::Main, key)? {
                        Some(again) if again.ln_id() == view.ln_id() && !again.is_deleted() => {
                            return Ok((OperationStatus::KeyExist, None));
                        }
                        _ => continue,
                    }
                }
                Some(view) => {
                    who.locker().lock(LockId::Record(view.ln_id()), LockType::Write)?;
                }
                None => range = Some(self.lock_insert_range(who.locker(), Scope::Main, key)?),
            }
            let expected = existing.as_ref().map(SlotView::ln_id);
            let attempt = tree.modify(Scope::Main, key, true, |edit| -> Result<Attempt<Position>, Error> {
                let current = edit.view();
                if current.as_ref().map(SlotView::ln_id) != expected {
                    return Ok(Attempt::Retry);
                }
                let old = self.slot_data(edit)?;
                let bytes = match data.partial() {
                    Some(p) => p.apply(&old, data.data()),
                    None => data.data().to_vec(),
                };
                let ln_id = match current {
                    Some(view) => {
                        if no_overwrite && !view.is_deleted() {
                            return Ok(Attempt::Retry);
                        }
                        let ln = self.ln(view.ln_id(), key, bytes.clone(), false);
                        let target = UndoTarget::Record {
                            main_key: None,
                            key: key.to_vec(),
                        };
                        self.log_over(who, edit, ln, key, target, Some(bytes))?;
                        view.ln_id()
                    }
                    None => {
                        let ln_id = self.env.cache.alloc_id();
                        who.locker().try_lock(LockId::Record(ln_id), LockType::Write)?;
                        let ln = self.ln(ln_id, key, bytes.clone(), false);
                        let target = UndoTarget::Record {
                            main_key: None,
                            key: key.to_vec(),
                        };
                        let lsn = self.env.log_ln(who, ln, Prior::absent(), target)?;
                        edit.insert(Slot::record(key.to_vec(), lsn, ln_id, Some(bytes)))?;
                        ln_id
                    }
                };
                Ok(Attempt::Done(Position {
                    key: key.to_vec(),
                    dup: None,
                    ln_id,
                }))
            })?;
            if let Some(range) = range {
                self.release_insert_range(who.locker(), range);
            }
            match attempt {
                Some(Ok(Attempt::Done(pos))) => return Ok((OperationStatus::Success, Some(pos))),
                Some(Ok(Attempt::Retry)) | None => continue,
                Some(Err(e)) => return Err(e),
            }
        }
    }

    fn put_dup(
        &self,
        who: WriteLocker<'_>,
        key: &[u8],
        data: &[u8],
        mode: PutMode,
    ) -> Result<(OperationStatus, Option<Position>), Error> {
        let tree = &self.db.tree;
        loop {
            let Some(main) = tree.get(Scope::Main, key)? else {
                let range = self.lock_insert_range(who.locker(), Scope::Main, key)?;
                let attempt = tree.modify(Scope::Main, key, true, |edit| {
                    if edit.slot().is_some() {
                        return Ok(Attempt::Retry);
                    }
                    self.new_dup_tree(who, edit, key, data).map(Attempt::Done)
                })?;
                self.release_insert_range(who.locker(), range);
                match attempt {
                    Some(Ok(Attempt::Done(pos))) => return Ok((OperationStatus::Success, Some(pos))),
                    Some(Ok(Attempt::Retry)) | None => continue,
                    Some(Err(e)) => return Err(e),
                }
            };
            let crate::tree::ViewTarget::Dup(count) = main.target else {
                return Err(corrupt("record slot in a database with sorted duplicates"));
            };
            if mode == PutMode::NoOverwrite && count.count > 0 {
                who.locker().lock(LockId::Record(count.ln_id), LockType::Read)?;
                match tree.get(Scope::Main, key)? {
                    Some(SlotView {
                        target: crate::tree::ViewTarget::Dup(again),
                        ..
                    }) if again.ln_id == count.ln_id && again.count > 0 => {
                        return Ok((OperationStatus::KeyExist, None));
                    }
                    _ => continue,
                }
            }
            who.locker().lock(LockId::Record(count.ln_id), LockType::Write)?;

            let existing = tree.get(Scope::Dup(&main.key), data)?;
            let mut range = None;
            match &existing {
                Some(view) if mode == PutMode::NoDupData && !view.is_deleted() => {
                    who.locker().lock(LockId::Record(view.ln_id()), LockType::Read)?;
                    match tree.get(Scope::Dup(&main.key), data)? {
                        Some(again) if again.ln_id() == view.ln_id() && !again.is_deleted() => {
                            return Ok((OperationStatus::KeyExist, None));
                        }
                        _ => continue,
                    }
                }
                Some(view) => {
                    who.locker().lock(LockId::Record(view.ln_id()), LockType::Write)?;
                }
                None => range = Some(self.lock_insert_range(who.locker(), Scope::Dup(&main.key), data)?),
            }
            let expected = existing.as_ref().map(SlotView::ln_id);
            let attempt = tree.modify(Scope::Dup(&main.key), data, true, |edit| -> Result<Attempt<Position>, Error> {
                if edit.dup_count().map(|c| c.ln_id) != Some(count.ln_id) {
                    return Ok(Attempt::Retry);
                }
                let current = edit.view();
                if current.as_ref().map(SlotView::ln_id) != expected {
                    return Ok(Attempt::Retry);
                }
                let target = UndoTarget::Record {
                    main_key: Some(main.key.clone()),
                    key: data.to_vec(),
                };
                let ln_id = match current {
                    Some(view) => {
                        if mode == PutMode::NoDupData && !view.is_deleted() {
                            return Ok(Attempt::Retry);
                        }
                        let ln = self.ln(view.ln_id(), &main.key, data.to_vec(), false);
                        self.log_over(who, edit, ln, data, target, None)?;
                        if view.is_deleted() {
                            self.bump_count(who, edit, &main.key, true)?;
                        }
                        view.ln_id()
                    }
                    None => {
                        let ln_id = self.env.cache.alloc_id();
                        who.locker().try_lock(LockId::Record(ln_id), LockType::Write)?;
                        let ln = self.ln(ln_id, &main.key, data.to_vec(), false);
                        let lsn = self.env.log_ln(who, ln, Prior::absent(), target)?;
                        edit.insert(Slot::record(data.to_vec(), lsn, ln_id, None))?;
                        self.bump_count(who, edit, &main.key, true)?;
                        ln_id
                    }
                };
                Ok(Attempt::Done(Position {
                    key: main.key.clone(),
                    dup: Some(data.to_vec()),
                    ln_id,
                }))
            })?;
            if let Some(range) = range {
                self.release_insert_range(who.locker(), range);
            }
            match attempt {
                Some(Ok(Attempt::Done(pos))) => return Ok((OperationStatus::Success, Some(pos))),
                Some(Ok(Attempt::Retry)) | None => continue,
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Creates the duplicate subtree of a new main key holding one record.
    fn new_dup_tree(
        &self,
        who: WriteLocker<'_>,
        edit: &mut LeafEdit<'_>,
        key: &[u8],
        data: &[u8],
    ) -> Result<Position, Error> {
        let count_id = self.env.cache.alloc_id();
        let ln_id = self.env.cache.alloc_id();
        who.locker().try_lock(LockId::Record(count_id), LockType::Write)?;
        who.locker().try_lock(LockId::Record(ln_id), LockType::Write)?;

        let count_ln = LnEntry {
            kind: LnKind::DupCount,
            db_id: self.db.id,
            ln_id: count_id,
            key: key.to_vec(),
            data: 1u64.to_be_bytes().to_vec(),
            deleted: false,
            txn: None,
        };
        let count_lsn = self.env.log_ln(
            who,
            count_ln,
            Prior::absent(),
            UndoTarget::DupCount {
                main_key: key.to_vec(),
                old_count: 0,
            },
        )?;
        let ln = self.ln(ln_id, key, data.to_vec(), false);
        let target = UndoTarget::Record {
            main_key: Some(key.to_vec()),
            key: data.to_vec(),
        };
        let lsn = self.env.log_ln(who, ln, Prior::absent(), target)?;
        edit.insert_dup_tree(
            key.to_vec(),
            DupCount {
                ln_id: count_id,
                lsn: count_lsn,
                count: 1,
            },
            Slot::record(data.to_vec(), lsn, ln_id, None),
        )?;
        Ok(Position {
            key: key.to_vec(),
            dup: Some(data.to_vec()),
            ln_id,
        })
    }

    /// Replaces the data of the current record.
    pub fn put_current(&mut self, data: &DatabaseEntry) -> Result<OperationStatus, Error> {
        self.op(|c| {
            let pos = c.pos.clone().ok_or_else(not_positioned)?;
            if let Some(dup) = &pos.dup {
                if data.partial().is_some() {
                    return Err(Error::InvalidArgument(
                        "partial data cannot be stored in a database with sorted duplicates".into(),
                    ));
                }
                if !c.db.tree.config().dup_cmp.equal(dup, data.data())? {
                    return Err(Error::InvalidArgument(
                        "the data of a sorted duplicate can only be replaced by equal data".into(),
                    ));
                }
            }
            let status = c.write(|c, who| c.overwrite_current(who, &pos, data))?;
            if status == OperationStatus::Success {
                if let Some(p) = c.pos.as_mut() {
                    if p.dup.is_some() {
                        p.dup = Some(data.data().to_vec());
                    }
                }
            }
            Ok(status)
        })
    }

    fn overwrite_current(
        &self,
        who: WriteLocker<'_>,
        pos: &Position,
        data: &DatabaseEntry,
    ) -> Result<OperationStatus, Error> {
        who.locker().lock(LockId::Record(pos.ln_id), LockType::Write)?;
        let (scope, slot_key) = match &pos.dup {
            Some(dup) => (Scope::Dup(&pos.key), dup.as_slice()),
            None => (Scope::Main, pos.key.as_slice()),
        };
        let outcome = self.db.tree.modify(scope, slot_key, false, |edit| {
            let Some(view) = edit.view() else {
                return Ok(OperationStatus::KeyEmpty);
            };
            if view.ln_id() != pos.ln_id || view.is_deleted() {
                return Ok(OperationStatus::KeyEmpty);
            }
            match &pos.dup {
                Some(_) => {
                    let ln = self.ln(pos.ln_id, &pos.key, data.data().to_vec(), false);
                    let target = UndoTarget::Record {
                        main_key: Some(pos.key.clone()),
                        key: data.data().to_vec(),
                    };
                    self.log_over(who, edit, ln, data.data(), target, None)?;
                }
                None => {
                    let old = self.slot_data(edit)?;
                    let bytes = match data.partial() {
                        Some(p) => p.apply(&old, data.data()),
                        None => data.data().to_vec(),
                    };
                    let ln = self.ln(pos.ln_id, &view.key, bytes.clone(), false);
                    let target = UndoTarget::Record {
                        main_key: None,
                        key: view.key.clone(),
                    };
                    self.log_over(who, edit, ln, &view.key, target, Some(bytes))?;
                }
            }
            Ok(OperationStatus::Success)
        })?;
        outcome.unwrap_or(Ok(OperationStatus::KeyEmpty))
    }

    /// Deletes the current record.
    pub fn delete(&mut self) -> Result<OperationStatus, Error> {
        self.op(|c| {
            let pos = c.pos.clone().ok_or_else(not_positioned)?;
            let status = c.write(|c, who| c.delete_at(who, &pos))?;
            if status == OperationStatus::Success {
                c.env.compressor.enqueue(c.db.id, pos.key, pos.dup);
            }
            Ok(status)
        })
    }

    fn delete_at(&self, who: WriteLocker<'_>, pos: &Position) -> Result<OperationStatus, Error> {
        let tree = &self.db.tree;
        let count_id = match &pos.dup {
            Some(_) => match tree.get(Scope::Main, &pos.key)? {
                Some(SlotView {
                    target: crate::tree::ViewTarget::Dup(count),
                    ..
                }) => {
                    who.locker().lock(LockId::Record(count.ln_id), LockType::Write)?;
                    Some(count.ln_id)
                }
                _ => return Ok(OperationStatus::KeyEmpty),
            },
            None => None,
        };
        who.locker().lock(LockId::Record(pos.ln_id), LockType::Write)?;
        let (scope, slot_key) = match &pos.dup {
            Some(dup) => (Scope::Dup(&pos.key), dup.as_slice()),
            None => (Scope::Main, pos.key.as_slice()),
        };
        let outcome = tree.modify(scope, slot_key, false, |edit| {
            let Some(view) = edit.view() else {
                return Ok(OperationStatus::KeyEmpty);
            };
            if view.ln_id() != pos.ln_id || view.is_deleted() {
                return Ok(OperationStatus::KeyEmpty);
            }
            if count_id.is_some() && edit.dup_count().map(|c| c.ln_id) != count_id {
                return Ok(OperationStatus::KeyEmpty);
            }
            // A deleted duplicate keeps its data so redo can find the slot.
            let data = if pos.dup.is_some() { view.key.clone() } else { Vec::new() };
            let ln = self.ln(pos.ln_id, &pos.key, data, true);
            let target = UndoTarget::Record {
                main_key: pos.dup.as_ref().map(|_| pos.key.clone()),
                key: view.key.clone(),
            };
            self.log_over(who, edit, ln, &view.key, target, None)?;
            if pos.dup.is_some() {
                self.bump_count(who, edit, &pos.key, false)?;
            }
            Ok(OperationStatus::Success)
        })?;
        outcome.unwrap_or(Ok(OperationStatus::KeyEmpty))
    }

    // --------------------------------------------------------------------------------------------
    // Write helpers, called under the bottom node's exclusive latch
    // --------------------------------------------------------------------------------------------

    fn ln(&self, ln_id: u64, key: &[u8], data: Vec<u8>, deleted: bool) -> LnEntry {
        LnEntry {
            kind: self.db.ln_kind(),
            db_id: self.db.id,
            ln_id,
            key: key.to_vec(),
            data,
            deleted,
            txn: None,
        }
    }

    /// Current data of the edited slot; empty for a missing or deleted one.
    fn slot_data(&self, edit: &LeafEdit<'_>) -> Result<Vec<u8>, Error> {
        let Some(slot) = edit.slot() else {
            return Ok(Vec::new());
        };
        match &slot.target {
            Target::Record { deleted: true, .. } => Ok(Vec::new()),
            Target::Record { data: Some(data), .. } => Ok(data.clone()),
            Target::Record { .. } => match self.env.log.read_entry(slot.lsn)? {
                LogEntry::Ln(ln) => Ok(ln.data),
                _ => Err(corrupt("record slot points at a non-record entry")),
            },
            _ => Err(corrupt("expected a record slot")),
        }
    }

    /// Logs `ln` over the existing slot of `edit` and points the slot at it.
    fn log_over(
        &self,
        who: WriteLocker<'_>,
        edit: &mut LeafEdit<'_>,
        ln: LnEntry,
        slot_key: &[u8],
        target: UndoTarget,
        cache: Option<Vec<u8>>,
    ) -> Result<Lsn, Error> {
        let Some(slot) = edit.slot() else {
            return Err(corrupt("no slot to overwrite"));
        };
        let prior = Prior {
            lsn: slot.lsn,
            deleted: slot.is_deleted(),
            key: (slot.key != slot_key).then(|| slot.key.clone()),
            data: match &slot.target {
                Target::Record { data, .. } => data.clone(),
                _ => None,
            },
        };
        let deleted = ln.deleted;
        let lsn = self.env.log_ln(who, ln, prior, target)?;
        if let Some(slot) = edit.slot_mut() {
            slot.lsn = lsn;
            slot.key = slot_key.to_vec();
            if let Target::Record {
                deleted: gone,
                data,
                ..
            } = &mut slot.target
            {
                *gone = deleted;
                *data = if deleted { None } else { cache };
            }
        }
        Ok(lsn)
    }

    /// Logs a new DupCountLN one above or below the current count.
    fn bump_count(&self, who: WriteLocker<'_>, edit: &mut LeafEdit<'_>, main_key: &[u8], up: bool) -> Result<(), Error> {
        let Some(old) = edit.dup_count().copied() else {
            return Err(corrupt("duplicate count missing"));
        };
        let count = if up { old.count + 1 } else { old.count.saturating_sub(1) };
        let ln = LnEntry {
            kind: LnKind::DupCount,
            db_id: self.db.id,
            ln_id: old.ln_id,
            key: main_key.to_vec(),
            data: count.to_be_bytes().to_vec(),
            deleted: false,
            txn: None,
        };
        let prior = Prior {
            lsn: old.lsn,
            deleted: old.lsn.is_null(),
            key: None,
            data: None,
        };
        let target = UndoTarget::DupCount {
            main_key: main_key.to_vec(),
            old_count: old.count,
        };
        let lsn = self.env.log_ln(who, ln, prior, target)?;
        if let Some(current) = edit.dup_count() {
            current.lsn = lsn;
            current.count = count;
        }
        Ok(())
    }
}

impl Drop for CursorImpl<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
