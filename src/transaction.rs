//! Transaction handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use crate::Error;
use crate::env::EnvironmentImpl;
use crate::txn::{Txn, TxnStatus};

/// An explicit transaction, from
/// [`Environment::begin_transaction`](crate::Environment::begin_transaction).
///
/// Pass it to database and cursor operations to make them part of the
/// transaction. A transaction must end with [`commit`](Self::commit) or
/// [`abort`](Self::abort) after its cursors are closed; one dropped while
/// still open is aborted.
pub struct Transaction {
    pub(crate) env: Arc<EnvironmentImpl>,
    pub(crate) txn: Arc<Txn>,
    ended: AtomicBool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.txn.id)
            .field("status", &self.txn.status())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(env: Arc<EnvironmentImpl>, txn: Arc<Txn>) -> Self {
        Self {
            env,
            txn,
            ended: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.txn.id
    }

    /// Makes every write of the transaction durable (per its
    /// [`Durability`](crate::Durability)) and releases its locks.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the transaction already ended, has open
    /// cursors or must abort after a failed operation.
    pub fn commit(&self) -> Result<(), Error> {
        self.check_not_ended()?;
        self.env.commit(&self.txn)?;
        self.ended.store(true, Ordering::Release);
        Ok(())
    }

    /// Undoes every write of the transaction and releases its locks.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when the transaction already ended or has open
    /// cursors.
    pub fn abort(&self) -> Result<(), Error> {
        self.check_not_ended()?;
        self.env.abort(&self.txn)?;
        self.ended.store(true, Ordering::Release);
        Ok(())
    }

    /// True once the transaction must be aborted.
    pub fn must_abort(&self) -> bool {
        self.txn.status() == TxnStatus::MustAbort
    }

    fn check_not_ended(&self) -> Result<(), Error> {
        if self.ended.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument(format!(
                "transaction {} has already ended",
                self.txn.id
            )));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.ended.load(Ordering::Acquire) || self.env.is_closed() {
            return;
        }
        if matches!(self.txn.status(), TxnStatus::Open | TxnStatus::MustAbort) {
            warn!(txn = self.txn.id, "transaction dropped while open, aborting");
            if let Err(e) = self.env.abort(&self.txn) {
                warn!(txn = self.txn.id, error = %e, "abort of dropped transaction failed");
            }
        }
    }
}
