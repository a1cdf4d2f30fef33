//! Cursor handle.

use std::sync::Arc;

use crate::{Error, KeyValue};
use crate::database::check_key;
use crate::env::cursor_impl::{CursorImpl, PutMode};
use crate::record::{DatabaseEntry, LockMode, OperationStatus, Partial};
use crate::txn::{Txn, TxnStatus};

/// A position in a database, from
/// [`Database::open_cursor`](crate::Database::open_cursor).
///
/// Moves return the key and data they land on, or `None` when there is no
/// such record. In a database with sorted duplicates the cursor visits
/// every duplicate of a key, in duplicate comparator order, before moving
/// to the next key.
///
/// A cursor opened in a transaction must be closed before the transaction
/// commits or aborts. Dropping the cursor closes it.
pub struct Cursor<'a> {
    inner: CursorImpl<'a>,
    txn: Option<Arc<Txn>>,
    read_only: bool,
    /// Range of the data that reads return, when set.
    read_partial: Option<Partial>,
    closed: bool,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("db", &self.inner.db().id)
            .field("txn", &self.txn.as_ref().map(|t| t.id))
            .field("positioned", &self.inner.is_positioned())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(inner: CursorImpl<'a>, txn: Option<Arc<Txn>>, read_only: bool) -> Result<Self, Error> {
        if let Some(txn) = &txn {
            let mut state = txn.state();
            if state.status != TxnStatus::Open {
                return Err(Error::InvalidArgument(format!(
                    "transaction {} is not open",
                    txn.id
                )));
            }
            state.cursors += 1;
        }
        Ok(Self {
            inner,
            txn,
            read_only,
            read_partial: None,
            closed: false,
        })
    }

    fn live(&mut self) -> Result<&mut CursorImpl<'a>, Error> {
        if self.closed {
            return Err(Error::InvalidArgument("cursor is closed".into()));
        }
        Ok(&mut self.inner)
    }

    /// Runs a read and trims the data it returns to the read range.
    fn read(
        &mut self,
        f: impl FnOnce(&mut CursorImpl<'a>) -> Result<Option<KeyValue>, Error>,
    ) -> Result<Option<KeyValue>, Error> {
        let partial = self.read_partial;
        let found = f(self.live()?)?;
        Ok(match (found, partial) {
            (Some((key, data)), Some(partial)) => Some((key, partial.extract(&data).to_vec())),
            (found, _) => found,
        })
    }

    /// Makes every later read return only `partial` of each record's
    /// data; `None` restores whole records. Keys are never trimmed.
    pub fn set_read_partial(&mut self, partial: Option<Partial>) {
        self.read_partial = partial;
    }

    fn writable(&mut self) -> Result<&mut CursorImpl<'a>, Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.live()
    }

    // --------------------------------------------------------------------------------------------
    // Moves
    // --------------------------------------------------------------------------------------------

    pub fn first(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.first(mode))
    }

    pub fn last(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.last(mode))
    }

    /// The next record; the first one when the cursor is not positioned.
    pub fn next(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.next(mode))
    }

    /// The previous record; the last one when the cursor is not positioned.
    pub fn prev(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.prev(mode))
    }

    /// The next duplicate of the current key, or `None` after the last.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the cursor is not positioned.
    pub fn next_dup(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.step_dup(true, mode))
    }

    /// The previous duplicate of the current key.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the cursor is not positioned.
    pub fn prev_dup(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.step_dup(false, mode))
    }

    /// The first record of the next key.
    pub fn next_no_dup(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.step_no_dup(true, mode))
    }

    /// The last record of the previous key.
    pub fn prev_no_dup(&mut self, mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.step_no_dup(false, mode))
    }

    // --------------------------------------------------------------------------------------------
    // Searches
    // --------------------------------------------------------------------------------------------

    pub fn search_key(&mut self, key: &[u8], mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.search_key(key, mode))
    }

    /// The first record whose key is greater than or equal to `key`.
    pub fn search_key_range(&mut self, key: &[u8], mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.search_key_range(key, mode))
    }

    pub fn search_both(&mut self, key: &[u8], data: &[u8], mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.search_both(key, data, false, mode))
    }

    /// Exact key, and the first duplicate greater than or equal to `data`.
    pub fn search_both_range(&mut self, key: &[u8], data: &[u8], mode: LockMode) -> Result<Option<KeyValue>, Error> {
        self.read(|c| c.search_both(key, data, true, mode))
    }

    /// The record at the cursor with `Success`, or `KeyEmpty` and no
    /// record once it has been deleted.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the cursor is not positioned.
    pub fn current(&mut self, mode: LockMode) -> Result<(OperationStatus, Option<KeyValue>), Error> {
        Ok(match self.read(|c| c.current(mode))? {
            Some(record) => (OperationStatus::Success, Some(record)),
            None => (OperationStatus::KeyEmpty, None),
        })
    }

    /// Number of duplicates of the current key; 1 without sorted
    /// duplicates.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the cursor is not positioned.
    pub fn count(&mut self) -> Result<u64, Error> {
        self.live()?.count()
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Stores a record and positions the cursor on it.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a partial key, `ReadOnly` for a read-only
    /// handle.
    pub fn put(&mut self, key: &DatabaseEntry, data: &DatabaseEntry) -> Result<OperationStatus, Error> {
        check_key(key)?;
        self.writable()?.put(key.data(), data, PutMode::Overwrite)
    }

    /// # Errors
    ///
    /// As for [`put`](Self::put).
    pub fn put_no_overwrite(&mut self, key: &DatabaseEntry, data: &DatabaseEntry) -> Result<OperationStatus, Error> {
        check_key(key)?;
        self.writable()?.put(key.data(), data, PutMode::NoOverwrite)
    }

    /// # Errors
    ///
    /// As for [`put`](Self::put), and `InvalidArgument` without sorted
    /// duplicates.
    pub fn put_no_dup_data(&mut self, key: &DatabaseEntry, data: &DatabaseEntry) -> Result<OperationStatus, Error> {
        check_key(key)?;
        self.writable()?.put(key.data(), data, PutMode::NoDupData)
    }

    /// Replaces the data of the record at the cursor. Returns `KeyEmpty`
    /// when that record has been deleted.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the cursor is not positioned, or when a
    /// duplicate would change its sort position.
    pub fn put_current(&mut self, data: &DatabaseEntry) -> Result<OperationStatus, Error> {
        self.writable()?.put_current(data)
    }

    /// Deletes the record at the cursor. Returns `KeyEmpty` when it is
    /// already deleted.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the cursor is not positioned.
    pub fn delete(&mut self) -> Result<OperationStatus, Error> {
        self.writable()?.delete()
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// A new cursor in the same transaction, at the same position when
    /// `same_position` is set.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when this cursor is closed or its transaction has
    /// ended.
    pub fn dup(&mut self, same_position: bool) -> Result<Cursor<'a>, Error> {
        let inner = self.live()?.duplicate(same_position);
        let mut dup = Cursor::new(inner, self.txn.clone(), self.read_only)?;
        dup.read_partial = self.read_partial;
        Ok(dup)
    }

    /// Closes the cursor and releases the locks it holds outside a
    /// transaction. Calling `close` more than once is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.inner.close();
        if let Some(txn) = &self.txn {
            let mut state = txn.state();
            state.cursors = state.cursors.saturating_sub(1);
        }
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
