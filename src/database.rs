//! Database handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{CursorConfig, DatabaseConfig};
use crate::cursor::Cursor;
use crate::env::EnvironmentImpl;
use crate::env::cursor_impl::{CursorImpl, CursorLocker, Isolation, PutMode};
use crate::env::dbtree::DbRef;
use crate::record::{DatabaseEntry, LockMode, OperationStatus, Partial};
use crate::transaction::Transaction;
use crate::tree::BtreeStats;
use crate::txn::{Locker, Txn};
use crate::{DatabaseId, Error};

/// An open database, from
/// [`Environment::open_database`](crate::Environment::open_database).
///
/// Every operation takes an optional [`Transaction`]. Without one, writes
/// to a transactional database run in a transaction of their own and reads
/// hold their lock only for the call.
///
/// While the handle is open, the database cannot be removed, renamed or
/// truncated (`HandleOpen`). Close it with [`close`](Self::close); a
/// dropped handle is closed too.
pub struct Database {
    env: Arc<EnvironmentImpl>,
    db: DbRef,
    name: String,
    read_only: bool,
    /// Holds the handle's read lock on the database.
    handle_locker: Mutex<Option<Locker>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("id", &self.db.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Database {
    pub(crate) fn new(
        env: Arc<EnvironmentImpl>,
        db: DbRef,
        name: &str,
        config: &DatabaseConfig,
        handle_locker: Locker,
    ) -> Self {
        db.handle_opened();
        debug!(name, db = db.id, "database handle opened");
        let read_only = config.read_only || env.config.read_only;
        Self {
            env,
            db,
            name: name.to_string(),
            read_only,
            handle_locker: Mutex::new(Some(handle_locker)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> DatabaseId {
        self.db.id
    }

    pub fn is_sorted_duplicates(&self) -> bool {
        self.db.sorted_duplicates
    }

    pub fn is_transactional(&self) -> bool {
        self.db.transactional
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Data stored under `key`; the first duplicate in a database with
    /// sorted duplicates.
    ///
    /// # Errors
    ///
    /// `Deadlock` or `LockTimeout` when the record stays locked,
    /// `RunRecovery` once the environment is invalid.
    pub fn get(&self, txn: Option<&Transaction>, key: &[u8], mode: LockMode) -> Result<Option<Vec<u8>>, Error> {
        self.read(txn, |c| c.search_key(key, mode))
            .map(|found| found.map(|(_, data)| data))
    }

    /// The `partial` range of the data stored under `key`, clipped to the
    /// data's length.
    ///
    /// # Errors
    ///
    /// As for [`get`](Self::get).
    pub fn get_partial(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        partial: Partial,
        mode: LockMode,
    ) -> Result<Option<Vec<u8>>, Error> {
        let data = self.get(txn, key, mode)?;
        Ok(data.map(|data| partial.extract(&data).to_vec()))
    }

    /// Whether the exact key and data pair is stored.
    ///
    /// # Errors
    ///
    /// As for [`get`](Self::get).
    pub fn search_both(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        data: &[u8],
        mode: LockMode,
    ) -> Result<OperationStatus, Error> {
        let found = self.read(txn, |c| c.search_both(key, data, false, mode))?;
        Ok(match found {
            Some(_) => OperationStatus::Success,
            None => OperationStatus::NotFound,
        })
    }

    /// Number of records, counting every duplicate. Takes no locks.
    ///
    /// # Errors
    ///
    /// `Closed` after the handle or environment is closed.
    pub fn count(&self) -> Result<u64, Error> {
        self.check_open()?;
        self.env.guard(self.db.tree.count_records().map_err(Error::from))
    }

    /// Node, record and height figures of the database tree. Takes no
    /// locks, so concurrent writers may skew the figures.
    ///
    /// # Errors
    ///
    /// `Closed`, or a log read failure for a non-resident node.
    pub fn stats(&self) -> Result<BtreeStats, Error> {
        self.check_open()?;
        self.env.guard(self.db.tree.stats().map_err(Error::from))
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Stores `data` under `key`, replacing the record (or, with sorted
    /// duplicates, adding a duplicate).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a partial key, `ReadOnly` for a read-only
    /// handle, lock errors when the record stays locked.
    pub fn put(&self, txn: Option<&Transaction>, key: &DatabaseEntry, data: &DatabaseEntry) -> Result<OperationStatus, Error> {
        self.put_with(txn, key, data, PutMode::Overwrite)
    }

    /// Stores the record unless the key exists (`KeyExist`).
    ///
    /// # Errors
    ///
    /// As for [`put`](Self::put).
    pub fn put_no_overwrite(
        &self,
        txn: Option<&Transaction>,
        key: &DatabaseEntry,
        data: &DatabaseEntry,
    ) -> Result<OperationStatus, Error> {
        self.put_with(txn, key, data, PutMode::NoOverwrite)
    }

    /// Adds a duplicate unless the key and data pair exists (`KeyExist`).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` unless the database has sorted duplicates;
    /// otherwise as for [`put`](Self::put).
    pub fn put_no_dup_data(
        &self,
        txn: Option<&Transaction>,
        key: &DatabaseEntry,
        data: &DatabaseEntry,
    ) -> Result<OperationStatus, Error> {
        self.put_with(txn, key, data, PutMode::NoDupData)
    }

    fn put_with(
        &self,
        txn: Option<&Transaction>,
        key: &DatabaseEntry,
        data: &DatabaseEntry,
        mode: PutMode,
    ) -> Result<OperationStatus, Error> {
        check_key(key)?;
        self.write(txn, |c| c.put(key.data(), data, mode))
    }

    /// Deletes `key` with all its duplicates. Returns `NotFound` when
    /// nothing was stored.
    ///
    /// # Errors
    ///
    /// `ReadOnly` for a read-only handle, lock errors when a record stays
    /// locked.
    pub fn delete(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<OperationStatus, Error> {
        self.write(txn, |c| {
            if c.search_key(key, LockMode::Rmw)?.is_none() {
                return Ok(OperationStatus::NotFound);
            }
            let mut status = OperationStatus::NotFound;
            loop {
                if c.delete()? == OperationStatus::Success {
                    status = OperationStatus::Success;
                }
                if c.step_dup(true, LockMode::Rmw)?.is_none() {
                    break;
                }
            }
            Ok(status)
        })
    }

    // --------------------------------------------------------------------------------------------
    // Cursors
    // --------------------------------------------------------------------------------------------

    /// Opens a cursor. A cursor opened in a transaction must be closed
    /// before the transaction ends.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a conflicting configuration or an ended
    /// transaction.
    pub fn open_cursor<'a>(&'a self, txn: Option<&Transaction>, config: CursorConfig) -> Result<Cursor<'a>, Error> {
        self.check_open()?;
        config.validate()?;
        let txn = txn.map(|t| Arc::clone(&t.txn));
        let mut iso = self.isolation(txn.as_deref());
        iso.read_committed |= config.read_committed;
        iso.read_uncommitted |= config.read_uncommitted;
        let inner = CursorImpl::new(&self.env, Arc::clone(&self.db), self.locker_for(txn.as_ref()), iso);
        Cursor::new(inner, txn, self.read_only)
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Closes the handle and releases its database lock. Calling `close`
    /// more than once is harmless.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` leaves room for flushing.
    pub fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db.handle_closed();
        drop(self.handle_locker.lock().take());
        debug!(name = %self.name, db = self.db.id, "database handle closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.env.check_usable()
    }

    fn isolation(&self, txn: Option<&Txn>) -> Isolation {
        match txn {
            Some(txn) => Isolation::of_txn(&txn.config),
            None => Isolation::default(),
        }
    }

    fn locker_for(&self, txn: Option<&Arc<Txn>>) -> CursorLocker {
        match txn {
            Some(txn) => CursorLocker::Txn(Arc::clone(txn)),
            None if self.db.transactional && self.env.config.transactional => {
                CursorLocker::AutoCommit(self.env.txns.basic_locker())
            }
            None => CursorLocker::NonTxn(self.env.txns.basic_locker()),
        }
    }

    fn read<T>(
        &self,
        txn: Option<&Transaction>,
        f: impl FnOnce(&mut CursorImpl<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.check_open()?;
        let txn = txn.map(|t| &t.txn);
        let mut cursor = CursorImpl::new(
            &self.env,
            Arc::clone(&self.db),
            self.locker_for(txn),
            self.isolation(txn.map(|t| &**t)),
        );
        let result = f(&mut cursor);
        cursor.close();
        result
    }

    /// Runs a write through one cursor, inside `txn` or a transaction of
    /// its own, so a multi-record write is atomic.
    fn write<T>(
        &self,
        txn: Option<&Transaction>,
        f: impl FnOnce(&mut CursorImpl<'_>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.check_open()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let txn = txn.map(|t| &t.txn);
        let run = |txn: Option<&Arc<Txn>>| {
            let mut cursor = CursorImpl::new(
                &self.env,
                Arc::clone(&self.db),
                self.locker_for(txn),
                self.isolation(txn.map(|t| &**t)),
            );
            let result = f(&mut cursor);
            cursor.close();
            result
        };
        if self.db.transactional {
            self.env.in_txn(txn, run)
        } else {
            run(txn)
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

pub(crate) fn check_key(key: &DatabaseEntry) -> Result<(), Error> {
    if key.partial().is_some() {
        return Err(Error::InvalidArgument("keys cannot be partial".into()));
    }
    Ok(())
}
