//! The environment core shared by every handle.
//!
//! [`EnvironmentImpl`] owns the log, the node cache, the transaction and
//! lock managers, the utilization tracker and the registry of open
//! databases. Public handles hold an `Arc` of it; the daemon threads hold
//! one too and are joined before the last handle lets go.
//!
//! Record writes are logged while the bottom node is exclusively latched,
//! through [`EnvironmentImpl::log_ln`]. Transactional writes leave an undo
//! record in the transaction; commit appends the commit record and counts
//! what the transaction superseded as obsolete, abort restores every slot
//! newest first.

pub(crate) mod compress;
pub(crate) mod cursor_impl;
pub(crate) mod dbtree;
pub(crate) mod dir_lock;
pub(crate) mod evictor;
pub(crate) mod scan;
pub(crate) mod validity;

pub(crate) use validity::Validity;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cleaner::{Cleaner, Obsolete, UtilizationTracker};
use crate::config::{ConfigManager, DatabaseConfig, Durability, EnvironmentConfig, TransactionConfig};
use crate::log::entry::{LnEntry, LogEntry, TxnEndEntry, TxnInfo, now_ms};
use crate::log::throttle::BackgroundIo;
use crate::log::{LogConfig, LogManager, Lsn};
use crate::record::{DatabaseEntry, LockMode, OperationStatus};
use crate::recovery::{self, checkpoint::Checkpointer};
use crate::tree::arena::NodeCache;
use crate::tree::comparator::{ByteComparator, KeyComparator};
use crate::tree::latch::ExclusiveLatch;
use crate::tree::node::{Node, Target};
use crate::tree::{Scope, Tree, TreeConfig};
use crate::txn::lock::{LockGrant, LockId, LockManager, LockType};
use crate::txn::{DbAction, Locker, Txn, TxnManager, TxnStatus, UndoRecord, UndoTarget};
use crate::{DatabaseId, Error};

use compress::Compressor;
use cursor_impl::{CursorImpl, CursorLocker, Isolation, PutMode};
use dir_lock::DirLock;
use dbtree::{
    DatabaseImpl, DbRef, FIRST_USER_DB_ID, MAPPING_DB_ID, MapRecord, NAMING_DB_ID, id_from_bytes,
    is_reserved, mapping_key,
};

// ------------------------------------------------------------------------------------------------
// Write helpers
// ------------------------------------------------------------------------------------------------

/// Who a record write is logged for.
#[derive(Clone, Copy)]
pub(crate) enum WriteLocker<'a> {
    Txn(&'a Txn),
    NonTxn(&'a Locker),
}

impl WriteLocker<'_> {
    pub fn locker(&self) -> &Locker {
        match self {
            WriteLocker::Txn(txn) => &txn.locker,
            WriteLocker::NonTxn(locker) => locker,
        }
    }

    pub fn txn(&self) -> Option<&Txn> {
        match self {
            WriteLocker::Txn(txn) => Some(txn),
            WriteLocker::NonTxn(_) => None,
        }
    }
}

/// What a slot held before a write; becomes the abort information.
#[derive(Debug, Clone)]
pub(crate) struct Prior {
    pub lsn: Lsn,
    pub deleted: bool,
    /// Key bytes, when the write replaces them.
    pub key: Option<Vec<u8>>,
    pub data: Option<Vec<u8>>,
}

impl Prior {
    /// A slot that did not exist.
    pub fn absent() -> Self {
        Self {
            lsn: Lsn::NULL,
            deleted: true,
            key: None,
            data: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// EnvironmentImpl
// ------------------------------------------------------------------------------------------------

pub(crate) struct EnvironmentImpl {
    pub home: PathBuf,
    pub config: EnvironmentConfig,
    pub mutable: ConfigManager,
    pub validity: Arc<Validity>,
    pub log: Arc<LogManager>,
    pub tracker: Arc<UtilizationTracker>,
    pub cache: Arc<NodeCache>,
    pub txns: TxnManager,
    pub io: BackgroundIo,
    pub compressor: Compressor,
    pub cleaner: Cleaner,
    pub checkpointer: Checkpointer,
    /// Shared by read-only handles; the checkpointer deletes files only
    /// under the exclusive lock.
    pub dir_lock: DirLock,
    dbs: RwLock<HashMap<DatabaseId, DbRef>>,
    /// Serializes loading databases from their MapLN.
    load_lock: Mutex<()>,
    next_db_id: AtomicU64,
    /// Set when `close` starts; `closed` follows once it finished.
    closing: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for EnvironmentImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentImpl")
            .field("home", &self.home)
            .field("valid", &self.validity.is_valid())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EnvironmentImpl {
    /// Opens the log in `home` and runs recovery.
    pub fn open(home: &Path, config: EnvironmentConfig) -> Result<Arc<Self>, Error> {
        config.validate()?;
        if !home.exists() {
            if !config.allow_create || config.read_only {
                return Err(Error::InvalidArgument(format!(
                    "environment home {} does not exist",
                    home.display()
                )));
            }
            fs::create_dir_all(home)?;
        }
        let has_log = fs::read_dir(home)?
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".jdb"));
        if !has_log && !config.allow_create {
            return Err(Error::InvalidArgument(format!(
                "no environment in {} and allow_create is off",
                home.display()
            )));
        }

        let dir_lock = DirLock::open(home, config.read_only)?;
        let validity = Arc::new(Validity::new());
        let tracker = Arc::new(UtilizationTracker::new());
        let log = Arc::new(LogManager::open(
            home,
            LogConfig {
                file_max: config.log_file_max,
                buffer_size: config.log_buffer_size,
                read_only: config.read_only,
            },
            Arc::clone(&tracker),
            Arc::clone(&validity),
        )?);
        let mutable = config.mutable.clone();
        let cache = Arc::new(NodeCache::new(Arc::clone(&log), mutable.cache_size));
        let locks = Arc::new(LockManager::new(config.lock_tables));
        let txns = TxnManager::new(locks, config.lock_timeout);
        let io = BackgroundIo::new(&mutable, config.io_sleep_hook.clone());

        let env = Arc::new(Self {
            home: home.to_path_buf(),
            mutable: ConfigManager::new(mutable),
            validity,
            log,
            tracker,
            cache,
            txns,
            io,
            compressor: Compressor::new(),
            cleaner: Cleaner::new(),
            checkpointer: Checkpointer::new(),
            dir_lock,
            dbs: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
            next_db_id: AtomicU64::new(FIRST_USER_DB_ID),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config,
        });

        recovery::recover(&env)?;
        info!(home = %home.display(), end = %env.log.end_of_log(), "environment opened");
        Ok(env)
    }

    /// Checkpoints (unless read-only or invalid) and flushes the log.
    ///
    /// The final checkpoint writes through the same paths as any other, so
    /// the environment only reports `Closed` once it is done.
    pub fn close(&self, checkpoint: bool) -> Result<(), Error> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let active = self.txns.active_count();
        if active > 0 {
            warn!(active, "closing environment with open transactions");
        }
        let result = self.shut_down(checkpoint);
        self.closed.store(true, Ordering::Release);
        self.dir_lock.release();
        match &result {
            Ok(()) => info!(home = %self.home.display(), "environment closed"),
            Err(e) => warn!(home = %self.home.display(), error = %e, "environment closed with errors"),
        }
        result
    }

    fn shut_down(&self, checkpoint: bool) -> Result<(), Error> {
        if self.config.read_only || !self.validity.is_valid() {
            return Ok(());
        }
        if checkpoint {
            recovery::checkpoint::run(self, true, "close")?;
        }
        self.log.close()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Validity
    // --------------------------------------------------------------------------------------------

    /// Fails with `Closed` or `RunRecovery` when the environment may not be
    /// used.
    pub fn check_usable(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if let Some(reason) = self.validity.invalid_reason() {
            return Err(Error::RunRecovery(reason));
        }
        Ok(())
    }

    pub fn check_writable(&self) -> Result<(), Error> {
        self.check_usable()?;
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Marks the environment closed without a checkpoint or log flush.
    #[cfg(test)]
    pub fn abandon(&self) {
        self.closing.store(true, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        self.dir_lock.release();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Invalidates the environment when `result` carries a fatal error.
    pub fn guard<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if matches!(e, Error::RunRecovery(_) | Error::Checksum(_)) {
                self.validity.invalidate(&e.to_string());
            }
        }
        result
    }

    // --------------------------------------------------------------------------------------------
    // Database registry
    // --------------------------------------------------------------------------------------------

    pub fn registry_get(&self, id: DatabaseId) -> Option<DbRef> {
        self.dbs.read().get(&id).cloned()
    }

    pub fn install_db(&self, db: DbRef) {
        self.dbs.write().insert(db.id, db);
    }

    /// Every loaded database, reserved ones included.
    pub fn databases(&self) -> Vec<DbRef> {
        let mut dbs: Vec<DbRef> = self.dbs.read().values().cloned().collect();
        dbs.sort_by_key(|db| db.id);
        dbs
    }

    pub fn reserved(&self, id: DatabaseId) -> Result<DbRef, Error> {
        self.registry_get(id)
            .ok_or_else(|| Error::RunRecovery(format!("reserved database {id} is not loaded")))
    }

    /// Ensures database ids handed out later are greater than `seen`.
    pub fn advance_db_ids(&self, seen: DatabaseId) {
        self.next_db_id.fetch_max(seen + 1, Ordering::Relaxed);
    }

    pub fn last_db_id(&self) -> DatabaseId {
        self.next_db_id.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// The database with `id`, loaded from its MapLN if needed. `None` when
    /// the database does not exist (any more).
    pub fn db(&self, id: DatabaseId) -> Result<Option<DbRef>, Error> {
        if let Some(db) = self.registry_get(id) {
            return Ok(Some(db));
        }
        if is_reserved(id) {
            return Ok(None);
        }
        let _load = self.load_lock.lock();
        if let Some(db) = self.registry_get(id) {
            return Ok(Some(db));
        }
        let Some(record) = self.map_record(id)? else {
            return Ok(None);
        };
        let db = Arc::new(self.open_tree(id, &record)?);
        self.install_db(Arc::clone(&db));
        debug!(db = id, root = %record.root_lsn, "loaded database");
        Ok(Some(db))
    }

    /// Builds the in-memory side of a database from its MapLN payload.
    pub fn open_tree(&self, id: DatabaseId, record: &MapRecord) -> Result<DatabaseImpl, Error> {
        let config = dbtree::tree_config(record, &self.config.comparators)?;
        let tree = Tree::open(id, Arc::clone(&self.cache), config, record.root_lsn)?;
        Ok(DatabaseImpl::new(
            id,
            tree,
            record.sorted_duplicates,
            record.transactional,
        ))
    }

    /// Current MapLN payload of a database, read without locking.
    pub fn map_record(&self, id: DatabaseId) -> Result<Option<MapRecord>, Error> {
        let mapping = self.reserved(MAPPING_DB_ID)?;
        let Some(view) = mapping.tree.get(Scope::Main, &mapping_key(id))? else {
            return Ok(None);
        };
        if view.is_deleted() {
            return Ok(None);
        }
        let bytes = self.record_data(&view)?;
        Ok(Some(MapRecord::from_bytes(&bytes)?))
    }

    /// Data of a record slot: the cached copy, or the LN read from the log.
    pub fn record_data(&self, view: &crate::tree::SlotView) -> Result<Vec<u8>, Error> {
        if let crate::tree::ViewTarget::Record { data: Some(data), .. } = &view.target {
            return Ok(data.clone());
        }
        match self.log.read_entry(view.lsn)? {
            LogEntry::Ln(ln) => Ok(ln.data),
            other => Err(Error::RunRecovery(format!(
                "expected a record at {}, found {}",
                view.lsn,
                other.entry_type().name()
            ))),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Logging
    // --------------------------------------------------------------------------------------------

    /// Logs a record write. Called with the bottom node exclusively latched.
    pub fn log_ln(
        &self,
        who: WriteLocker<'_>,
        mut ln: LnEntry,
        prior: Prior,
        target: UndoTarget,
    ) -> Result<Lsn, Error> {
        let db_id = ln.db_id;
        let superseded =
            (!prior.lsn.is_null() && !prior.deleted).then(|| Obsolete::ln(prior.lsn, None, db_id));
        let deleted = ln.deleted;
        match who {
            WriteLocker::Txn(txn) => {
                ln.txn = Some(TxnInfo {
                    txn_id: txn.id,
                    prev_lsn: txn.last_lsn(),
                    abort_lsn: prior.lsn,
                    abort_deleted: prior.deleted,
                    abort_key: prior.key.clone(),
                });
                let ln_id = ln.ln_id;
                let (lsn, size) = self.log.append_sized(&LogEntry::Ln(ln), false)?;
                txn.logged(lsn);
                txn.push_undo(UndoRecord {
                    db_id,
                    target,
                    ln_id,
                    lsn,
                    size,
                    abort_lsn: prior.lsn,
                    abort_deleted: prior.deleted,
                    abort_key: prior.key,
                    abort_data: prior.data,
                });
                if let Some(old) = superseded {
                    txn.obsolete_on_commit(old);
                }
                if deleted {
                    txn.obsolete_on_commit(Obsolete::ln(lsn, Some(size), db_id));
                }
                Ok(lsn)
            }
            WriteLocker::NonTxn(_) => {
                let entry = LogEntry::Ln(ln);
                let superseded: Vec<Obsolete> = superseded.into_iter().collect();
                let (lsn, _) = if deleted {
                    self.log.append_dead(&entry, &superseded)?
                } else {
                    self.log.append_obsoleting(&entry, false, &superseded)?
                };
                Ok(lsn)
            }
        }
    }

    /// Logs a node the caller holds exclusively latched. Resident children
    /// that were never logged are logged first, provisionally, so the image
    /// refers only to logged nodes.
    pub fn log_node(&self, node: &mut Node, provisional: bool) -> Result<Lsn, Error> {
        let budget = self.cache.budget();
        for i in 0..node.slots.len() {
            let slot = &node.slots[i];
            if !slot.lsn.is_null() || matches!(slot.target, Target::Record { .. }) {
                continue;
            }
            let Some(child) = slot.child_id().and_then(|id| self.cache.get(id)) else {
                continue;
            };
            let mut child = ExclusiveLatch::acquire(&child, budget);
            let lsn = self.log_node(&mut child, true)?;
            node.slots[i].lsn = lsn;
        }
        let obsolete: Vec<Obsolete> = (!node.last_logged.is_null())
            .then(|| Obsolete::node(node.last_logged, node.db_id))
            .into_iter()
            .collect();
        let (lsn, _) =
            self.log
                .append_obsoleting(&LogEntry::Node(node.to_image()), provisional, &obsolete)?;
        node.last_logged = lsn;
        node.dirty = false;
        Ok(lsn)
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    pub fn begin_txn(&self, config: TransactionConfig) -> Result<Arc<Txn>, Error> {
        self.check_usable()?;
        if !self.config.transactional {
            return Err(Error::InvalidArgument(
                "environment is not transactional".into(),
            ));
        }
        config.validate()?;
        Ok(self.txns.begin(config, false))
    }

    fn check_endable(txn: &Txn) -> Result<(), Error> {
        let state = txn.state();
        match state.status {
            TxnStatus::Open | TxnStatus::MustAbort => {}
            TxnStatus::Committed | TxnStatus::Aborted => {
                return Err(Error::InvalidArgument(format!(
                    "transaction {} has already ended",
                    txn.id
                )));
            }
        }
        if state.cursors > 0 {
            return Err(Error::InvalidArgument(format!(
                "transaction {} has {} open cursors",
                txn.id, state.cursors
            )));
        }
        Ok(())
    }

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the transaction has ended, has open cursors or
    /// must abort; log errors otherwise.
    pub fn commit(&self, txn: &Txn) -> Result<(), Error> {
        self.check_usable()?;
        Self::check_endable(txn)?;
        if txn.status() == TxnStatus::MustAbort {
            return Err(Error::InvalidArgument(format!(
                "transaction {} must be aborted",
                txn.id
            )));
        }
        let (last_lsn, obsolete, actions) = {
            let mut state = txn.state();
            (
                state.last_lsn,
                std::mem::take(&mut state.obsolete_on_commit),
                std::mem::take(&mut state.db_actions),
            )
        };
        if !last_lsn.is_null() {
            let entry = LogEntry::Commit(TxnEndEntry {
                txn_id: txn.id,
                last_lsn,
                time_ms: now_ms(),
            });
            let logged = self
                .log
                .append_obsoleting(&entry, false, &obsolete)
                .map_err(Error::from)
                .and_then(|_| match txn.config.durability {
                    Durability::Sync => Ok(self.log.flush(true)?),
                    Durability::WriteNoSync => Ok(self.log.flush(false)?),
                    Durability::NoSync => Ok(()),
                });
            if let Err(e) = logged {
                txn.set_must_abort();
                return self.guard(Err(e));
            }
        }
        for action in actions {
            if let DbAction::DeleteOnCommit(id) = action {
                if let Err(e) = self.delete_db_contents(id) {
                    warn!(db = id, error = %e, "deleting database at commit failed");
                }
            }
        }
        txn.state().status = TxnStatus::Committed;
        txn.locker.release_all();
        self.txns.finish(txn, true);
        if !txn.auto_commit {
            debug!(txn = txn.id, "transaction committed");
        }
        Ok(())
    }

    /// Aborts a transaction, restoring every slot it modified.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the transaction has ended or has open cursors.
    pub fn abort(&self, txn: &Txn) -> Result<(), Error> {
        Self::check_endable(txn)?;
        let (last_lsn, undo, actions) = {
            let mut state = txn.state();
            state.obsolete_on_commit.clear();
            (
                state.last_lsn,
                std::mem::take(&mut state.undo),
                std::mem::take(&mut state.db_actions),
            )
        };
        if self.validity.is_valid() {
            for record in undo.iter().rev() {
                if let Err(e) = self.undo(record) {
                    let _ = self.guard::<()>(Err(Error::RunRecovery(format!(
                        "undo of transaction {} failed: {e}",
                        txn.id
                    ))));
                    break;
                }
            }
            if !last_lsn.is_null() && !self.config.read_only {
                let entry = LogEntry::Abort(TxnEndEntry {
                    txn_id: txn.id,
                    last_lsn,
                    time_ms: now_ms(),
                });
                let dead: Vec<Obsolete> = undo
                    .iter()
                    .map(|r| Obsolete::ln(r.lsn, Some(r.size), r.db_id))
                    .collect();
                if let Err(e) = self.log.append_obsoleting(&entry, false, &dead) {
                    warn!(txn = txn.id, error = %e, "logging abort failed");
                }
            }
        }
        txn.state().status = TxnStatus::Aborted;
        txn.locker.release_all();
        for action in actions {
            if let DbAction::DeleteOnAbort(id) = action {
                if let Err(e) = self.delete_db_contents(id) {
                    warn!(db = id, error = %e, "deleting database at abort failed");
                }
            }
        }
        self.txns.finish(txn, false);
        if !txn.auto_commit {
            debug!(txn = txn.id, undone = undo.len(), "transaction aborted");
        }
        Ok(())
    }

    /// Restores one slot to its state before the transaction wrote it.
    fn undo(&self, record: &UndoRecord) -> Result<(), Error> {
        let Some(db) = self.registry_get(record.db_id) else {
            return Ok(());
        };
        match &record.target {
            UndoTarget::Record { main_key, key } => {
                let scope = match main_key {
                    Some(k) => Scope::Dup(k),
                    None => Scope::Main,
                };
                let now_deleted = db.tree.modify(scope, key, false, |edit| {
                    let Some(slot) = edit.slot_mut() else {
                        return false;
                    };
                    if slot.ln_id() != Some(record.ln_id) || slot.lsn != record.lsn {
                        return false;
                    }
                    slot.lsn = record.abort_lsn;
                    if let Some(old_key) = &record.abort_key {
                        slot.key = old_key.clone();
                    }
                    let gone = record.abort_deleted || record.abort_lsn.is_null();
                    if let Target::Record { deleted, data, .. } = &mut slot.target {
                        *deleted = gone;
                        *data = if gone { None } else { record.abort_data.clone() };
                    }
                    gone
                })?;
                if now_deleted == Some(true) {
                    match main_key {
                        Some(k) => self.compressor.enqueue(db.id, k.clone(), Some(key.clone())),
                        None => self.compressor.enqueue(db.id, key.clone(), None),
                    }
                }
            }
            UndoTarget::DupCount {
                main_key,
                old_count,
            } => {
                db.tree.modify(Scope::Main, main_key, false, |edit| {
                    let Some(slot) = edit.slot_mut() else {
                        return;
                    };
                    if let Target::DupTree { count, .. } = &mut slot.target {
                        if count.ln_id == record.ln_id && count.lsn == record.lsn {
                            count.lsn = record.abort_lsn;
                            count.count = *old_count;
                        }
                    }
                })?;
            }
        }
        Ok(())
    }

    /// Runs `f` in `txn`, or in an auto-commit transaction when `txn` is
    /// `None` and the environment is transactional.
    pub fn in_txn<T>(
        &self,
        txn: Option<&Arc<Txn>>,
        f: impl FnOnce(Option<&Arc<Txn>>) -> Result<T, Error>,
    ) -> Result<T, Error> {
        if txn.is_some() || !self.config.transactional {
            return f(txn);
        }
        let auto = self.txns.begin(TransactionConfig::default(), true);
        match f(Some(&auto)) {
            Ok(value) => {
                self.commit(&auto)?;
                Ok(value)
            }
            Err(e) => {
                let _ = self.abort(&auto);
                Err(e)
            }
        }
    }

    fn locker_for(&self, txn: Option<&Arc<Txn>>) -> CursorLocker {
        match txn {
            Some(txn) => CursorLocker::Txn(Arc::clone(txn)),
            None => CursorLocker::NonTxn(self.txns.basic_locker()),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reserved-database records
    // --------------------------------------------------------------------------------------------

    /// Writes a record of a non-transactional reserved database.
    pub fn put_non_txn(&self, db: &DbRef, key: &[u8], data: &[u8]) -> Result<(), Error> {
        let locker = CursorLocker::NonTxn(self.txns.basic_locker());
        let mut cursor = CursorImpl::new(self, Arc::clone(db), locker, Isolation::default());
        cursor.put(key, &DatabaseEntry::new(data), PutMode::Overwrite)?;
        Ok(())
    }

    /// Deletes a record of a non-transactional reserved database.
    pub fn delete_non_txn(&self, db: &DbRef, key: &[u8]) -> Result<bool, Error> {
        let locker = CursorLocker::NonTxn(self.txns.basic_locker());
        let mut cursor = CursorImpl::new(self, Arc::clone(db), locker, Isolation::default());
        if cursor.search_key(key, LockMode::Rmw)?.is_none() {
            return Ok(false);
        }
        Ok(cursor.delete()? == OperationStatus::Success)
    }

    pub fn write_map_record(&self, db: &DatabaseImpl) -> Result<(), Error> {
        let mapping = self.reserved(MAPPING_DB_ID)?;
        self.put_non_txn(&mapping, &mapping_key(db.id), &db.map_record().to_bytes()?)
    }

    // --------------------------------------------------------------------------------------------
    // Database names
    // --------------------------------------------------------------------------------------------

    fn lookup_name(
        &self,
        txn: Option<&Arc<Txn>>,
        name: &str,
        mode: LockMode,
    ) -> Result<Option<DatabaseId>, Error> {
        let naming = self.reserved(NAMING_DB_ID)?;
        let mut cursor = CursorImpl::new(self, naming, self.locker_for(txn), Isolation::default());
        let found = cursor.search_key(name.as_bytes(), mode)?;
        cursor.close();
        match found {
            Some((_, data)) => Ok(Some(id_from_bytes(&data).ok_or_else(|| {
                Error::RunRecovery(format!("malformed NameLN for {name:?}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Names of the user databases, sorted.
    pub fn database_names(&self) -> Result<Vec<String>, Error> {
        self.check_usable()?;
        let naming = self.reserved(NAMING_DB_ID)?;
        let locker = CursorLocker::NonTxn(self.txns.basic_locker());
        let mut cursor = CursorImpl::new(self, naming, locker, Isolation::default());
        let mut names = Vec::new();
        let mut next = cursor.first(LockMode::ReadCommitted)?;
        while let Some((key, _)) = next {
            names.push(String::from_utf8_lossy(&key).into_owned());
            next = cursor.next(LockMode::ReadCommitted)?;
        }
        Ok(names)
    }

    /// Names of user databases keyed by id, for log scans.
    pub fn names_by_id(&self) -> Result<HashMap<DatabaseId, String>, Error> {
        let naming = self.reserved(NAMING_DB_ID)?;
        let locker = CursorLocker::NonTxn(self.txns.basic_locker());
        let mut cursor = CursorImpl::new(self, naming, locker, Isolation::default());
        let mut names = HashMap::new();
        let mut next = cursor.first(LockMode::ReadUncommitted)?;
        while let Some((key, data)) = next {
            if let Some(id) = id_from_bytes(&data) {
                names.insert(id, String::from_utf8_lossy(&key).into_owned());
            }
            next = cursor.next(LockMode::ReadUncommitted)?;
        }
        Ok(names)
    }

    /// Ids of every database named in the naming database.
    pub fn named_ids(&self) -> Result<Vec<DatabaseId>, Error> {
        Ok(self.names_by_id()?.into_keys().collect())
    }

    fn resolve_comparator(&self, name: Option<&str>) -> Result<KeyComparator, Error> {
        match name {
            None => Ok(KeyComparator::bytes()),
            Some(n) if n == ByteComparator::NAME => Ok(KeyComparator::bytes()),
            Some(n) => self
                .config
                .comparators
                .get(n)
                .map(KeyComparator::new)
                .ok_or_else(|| Error::InvalidComparator(format!("comparator {n:?} is not registered"))),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Database lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens or creates the database `name`.
    pub fn open_db(
        &self,
        txn: Option<&Arc<Txn>>,
        name: &str,
        config: &DatabaseConfig,
    ) -> Result<DbRef, Error> {
        self.check_usable()?;
        config.validate()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("database name must not be empty".into()));
        }
        self.in_txn(txn, |txn| self.open_db_in(txn, name, config))
    }

    fn open_db_in(
        &self,
        txn: Option<&Arc<Txn>>,
        name: &str,
        config: &DatabaseConfig,
    ) -> Result<DbRef, Error> {
        loop {
            if let Some(id) = self.lookup_name(txn, name, LockMode::Default)? {
                if config.exclusive_create {
                    return Err(Error::DatabaseExists(name.to_string()));
                }
                let db = self
                    .db(id)?
                    .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))?;
                if db.sorted_duplicates != config.sorted_duplicates {
                    return Err(Error::InvalidArgument(format!(
                        "database {name:?} was created with sorted_duplicates = {}",
                        db.sorted_duplicates
                    )));
                }
                let tree_config = db.tree.config();
                if let Some(cmp) = &config.btree_comparator {
                    if cmp != tree_config.cmp.name() {
                        return Err(Error::InvalidArgument(format!(
                            "database {name:?} uses comparator {:?}",
                            tree_config.cmp.name()
                        )));
                    }
                }
                if db.sorted_duplicates {
                    tree_config.cmp.validate_distinct()?;
                    tree_config.dup_cmp.validate_distinct()?;
                }
                return Ok(db);
            }
            if !config.allow_create {
                return Err(Error::DatabaseNotFound(name.to_string()));
            }
            if self.config.read_only || config.read_only {
                return Err(Error::ReadOnly);
            }
            let cmp = self.resolve_comparator(config.btree_comparator.as_deref())?;
            let dup_cmp = self.resolve_comparator(config.duplicate_comparator.as_deref())?;
            if config.sorted_duplicates {
                cmp.validate_distinct()?;
                dup_cmp.validate_distinct()?;
            }
            let tree_config = TreeConfig {
                cmp,
                dup_cmp,
                node_max: config.node_max_entries.unwrap_or(self.config.node_max_entries),
                dup_node_max: self.config.dup_node_max_entries,
            };
            let db = self.create_db(
                tree_config,
                config.sorted_duplicates,
                config.transactional && self.config.transactional,
            )?;
            if !self.insert_name(txn, name, db.id, PutMode::NoOverwrite)? {
                // Another creator won; use theirs.
                self.delete_db_contents(db.id)?;
                continue;
            }
            if let Some(txn) = txn {
                txn.push_db_action(DbAction::DeleteOnAbort(db.id));
            }
            info!(name, db = db.id, "database created");
            return Ok(db);
        }
    }

    fn create_db(
        &self,
        tree_config: TreeConfig,
        sorted_duplicates: bool,
        transactional: bool,
    ) -> Result<DbRef, Error> {
        let id = self.next_db_id.fetch_add(1, Ordering::Relaxed);
        let tree = Tree::create(id, Arc::clone(&self.cache), tree_config);
        let db = Arc::new(DatabaseImpl::new(id, tree, sorted_duplicates, transactional));
        self.write_map_record(&db)?;
        self.install_db(Arc::clone(&db));
        Ok(db)
    }

    fn insert_name(
        &self,
        txn: Option<&Arc<Txn>>,
        name: &str,
        id: DatabaseId,
        mode: PutMode,
    ) -> Result<bool, Error> {
        let naming = self.reserved(NAMING_DB_ID)?;
        let mut cursor = CursorImpl::new(self, naming, self.locker_for(txn), Isolation::default());
        let status = cursor.put(name.as_bytes(), &DatabaseEntry::new(id.to_be_bytes()), mode)?;
        cursor.close();
        Ok(status == OperationStatus::Success)
    }

    fn delete_name(&self, txn: Option<&Arc<Txn>>, name: &str) -> Result<(), Error> {
        let naming = self.reserved(NAMING_DB_ID)?;
        let mut cursor = CursorImpl::new(self, naming, self.locker_for(txn), Isolation::default());
        if cursor.search_key(name.as_bytes(), LockMode::Rmw)?.is_some() {
            cursor.delete()?;
        }
        cursor.close();
        Ok(())
    }

    /// Locks a named database for a structural change. Fails with
    /// `HandleOpen` while any handle is open on it.
    fn lock_for_change(
        &self,
        txn: Option<&Arc<Txn>>,
        name: &str,
    ) -> Result<(DbRef, Option<Locker>), Error> {
        let id = self
            .lookup_name(txn, name, LockMode::Rmw)?
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))?;
        let db = self
            .db(id)?
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))?;
        let claim = |locker: &Locker| -> Result<(), Error> {
            let grant = locker.try_lock(LockId::Database(id), LockType::Write)?;
            if grant == LockGrant::Denied || db.open_handles() > 0 {
                return Err(Error::HandleOpen(format!(
                    "database {name:?} has open handles"
                )));
            }
            Ok(())
        };
        match txn {
            Some(txn) => {
                claim(&txn.locker)?;
                Ok((db, None))
            }
            None => {
                let own = self.txns.basic_locker();
                claim(&own)?;
                Ok((db, Some(own)))
            }
        }
    }

    /// Removes a database.
    pub fn remove_db(&self, txn: Option<&Arc<Txn>>, name: &str) -> Result<(), Error> {
        self.check_writable()?;
        self.in_txn(txn, |txn| {
            let (db, _locker) = self.lock_for_change(txn, name)?;
            self.delete_name(txn, name)?;
            match txn {
                Some(txn) => txn.push_db_action(DbAction::DeleteOnCommit(db.id)),
                None => self.delete_db_contents(db.id)?,
            }
            info!(name, db = db.id, "database removed");
            Ok(())
        })
    }

    /// Renames a database.
    pub fn rename_db(&self, txn: Option<&Arc<Txn>>, from: &str, to: &str) -> Result<(), Error> {
        self.check_writable()?;
        if to.is_empty() {
            return Err(Error::InvalidArgument("database name must not be empty".into()));
        }
        self.in_txn(txn, |txn| {
            let (db, _locker) = self.lock_for_change(txn, from)?;
            if self.lookup_name(txn, to, LockMode::Rmw)?.is_some() {
                return Err(Error::DatabaseExists(to.to_string()));
            }
            self.delete_name(txn, from)?;
            if !self.insert_name(txn, to, db.id, PutMode::NoOverwrite)? {
                return Err(Error::DatabaseExists(to.to_string()));
            }
            info!(from, to, db = db.id, "database renamed");
            Ok(())
        })
    }

    /// Empties a database by giving its name a fresh, empty tree. Returns
    /// the number of records discarded when `count` is set.
    pub fn truncate_db(&self, txn: Option<&Arc<Txn>>, name: &str, count: bool) -> Result<u64, Error> {
        self.check_writable()?;
        self.in_txn(txn, |txn| {
            let (old, _locker) = self.lock_for_change(txn, name)?;
            let discarded = if count { old.tree.count_records()? } else { 0 };
            let fresh = self.create_db(
                old.tree.config().clone(),
                old.sorted_duplicates,
                old.transactional,
            )?;
            if let Some(txn) = txn {
                txn.push_db_action(DbAction::DeleteOnAbort(fresh.id));
            }
            self.insert_name(txn, name, fresh.id, PutMode::Overwrite)?;
            match txn {
                Some(txn) => txn.push_db_action(DbAction::DeleteOnCommit(old.id)),
                None => self.delete_db_contents(old.id)?,
            }
            info!(name, old = old.id, new = fresh.id, discarded, "database truncated");
            Ok(discarded)
        })
    }

    /// Deletes a database's MapLN and drops its nodes; everything it logged
    /// becomes obsolete.
    pub fn delete_db_contents(&self, id: DatabaseId) -> Result<(), Error> {
        let Some(db) = self.db(id)? else {
            return Ok(());
        };
        if db.is_deleted() {
            return Ok(());
        }
        let _pending = self.cleaner.deleting_db(id);
        let tracker = &self.tracker;
        let counted = db.tree.visit_lsns(&mut |lsn, node| {
            let obsolete = if node {
                Obsolete::node(lsn, id)
            } else {
                Obsolete::ln(lsn, None, id)
            };
            tracker.count_obsolete(&obsolete);
        });
        if let Err(e) = counted {
            warn!(db = id, error = %e, "could not count every entry of a deleted database");
        }
        let mapping = self.reserved(MAPPING_DB_ID)?;
        self.delete_non_txn(&mapping, &mapping_key(id))?;
        db.mark_deleted();
        self.dbs.write().remove(&id);
        self.cache.purge_db(id);
        info!(db = id, "database deleted");
        Ok(())
    }
}
