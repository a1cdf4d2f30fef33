//! Recovery.
//!
//! Opening an environment rebuilds its in-memory state from the log:
//!
//! 1. **Find** the last CkptEnd by scanning backwards from the end of the
//!    log. Its mapping root is the starting point for every tree.
//! 2. **Analyze** the log from the redo start (the CkptStart, or the first
//!    active transaction if earlier) to the end: transaction outcomes, the
//!    highest ids in use, and the records written by transactions.
//! 3. **Redo** the MapLNs first, so every tree opens from its newest root,
//!    then every non-transactional or committed record logged after the
//!    CkptStart. A slot only moves forward: a record is applied when its
//!    LSN is newer than what the slot holds.
//! 4. **Undo** the records of transactions that aborted or never ended,
//!    newest first, when the slot still carries them.
//! 5. **Count** utilization for everything logged after the persisted
//!    summaries.
//! 6. Databases no name refers to any more are deleted, and a checkpoint
//!    is written when anything follows the last one.
//!
//! A new environment takes the same path: with no checkpoint the reserved
//! trees start empty and the naming and utilization MapLNs are written.

pub(crate) mod checkpoint;

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, atomic::Ordering};

use tracing::{debug, info, trace, warn};

use crate::cleaner::{Obsolete, SummaryRecord, file_from_summary_key};
use crate::env::EnvironmentImpl;
use crate::env::dbtree::{
    DatabaseImpl, DbRef, MAPPING_DB_ID, NAMING_DB_ID, UTILIZATION_DB_ID, id_from_bytes, is_reserved,
};
use crate::log::entry::{CkptEndEntry, LnEntry, LnKind, LogEntry, LogEntryType};
use crate::log::scanner::{BackwardScanner, ForwardScanner};
use crate::log::{LogError, Lsn};
use crate::tree::comparator::KeyComparator;
use crate::tree::node::{DupCount, Slot, Target};
use crate::tree::{Scope, Seek, Tree, TreeConfig};
use crate::{DatabaseId, Error, TxnId};

use checkpoint::CheckpointInfo;

/// Errors specific to recovery.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// A reserved database has no MapLN in an environment that cannot be
    /// written.
    #[error("reserved database {0} is missing and the environment is read-only")]
    MissingReserved(DatabaseId),

    /// A duplicate record names a main key that holds a plain record.
    #[error("database {db}: duplicate record under a key without a duplicate subtree")]
    DupConflict { db: DatabaseId },

    /// A DupCountLN holds no 8-byte count.
    #[error("malformed duplicate count at {0}")]
    BadCount(Lsn),
}

/// What one recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RecoveryRun {
    entries: u64,
    redone: u64,
    undone: u64,
    committed: u64,
    uncommitted: u64,
    orphans: u64,
}

/// A record written by a transaction.
struct TxnLn {
    lsn: Lsn,
    size: u32,
    ln: LnEntry,
}

/// Everything the analysis pass learns.
#[derive(Default)]
struct Analysis {
    committed: HashMap<TxnId, Lsn>,
    aborted: HashMap<TxnId, Lsn>,
    txn_lns: Vec<TxnLn>,
    /// MapLNs logged after the redo start, in log order.
    map_lns: Vec<(Lsn, u32, LnEntry)>,
    max_node_id: u64,
    max_db_id: DatabaseId,
    max_txn_id: TxnId,
}

impl Analysis {
    fn outcome(&self, txn: TxnId) -> Outcome {
        if let Some(&lsn) = self.committed.get(&txn) {
            Outcome::Committed(lsn)
        } else if let Some(&lsn) = self.aborted.get(&txn) {
            Outcome::Aborted(lsn)
        } else {
            Outcome::Open
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed(Lsn),
    Aborted(Lsn),
    Open,
}

/// Utilization events gathered while replaying, applied once the persisted
/// summaries are loaded.
#[derive(Default)]
struct Counting {
    new: Vec<(Lsn, LogEntryType, u32, Option<DatabaseId>)>,
    obsolete: Vec<(Obsolete, Lsn)>,
}

/// Rebuilds `env` from its log.
///
/// # Errors
///
/// Log errors (a checksum failure anywhere but the tail is fatal), tree
/// errors, and `InvalidComparator` when a database names a comparator
/// that is not registered.
pub(crate) fn recover(env: &Arc<EnvironmentImpl>) -> Result<(), Error> {
    let fresh_log = env.log.stats().files_created.load(Ordering::Relaxed) > 0;
    let last = find_last_checkpoint(env)?;
    let (start, undo_start) = match &last {
        Some((_, end)) => {
            let undo_start = if !end.first_active.is_null() && end.first_active < end.ckpt_start {
                end.first_active
            } else {
                end.ckpt_start
            };
            (end.ckpt_start, undo_start)
        }
        None => {
            let log_start = log_start(env)?;
            (log_start, log_start)
        }
    };
    debug!(%start, %undo_start, checkpoint = last.is_some(), "recovery starting");

    let mut run = RecoveryRun::default();
    let mut analysis = analyze(env, undo_start, start, &mut run)?;
    if let Some((_, end)) = &last {
        analysis.max_node_id = analysis.max_node_id.max(end.last_node_id);
        analysis.max_db_id = analysis.max_db_id.max(end.last_db_id);
        analysis.max_txn_id = analysis.max_txn_id.max(end.last_txn_id);
    }
    env.cache.advance_ids(analysis.max_node_id);
    env.advance_db_ids(analysis.max_db_id);
    env.txns.advance_ids(analysis.max_txn_id);

    let mut counting = Counting::default();
    install_mapping(env, last.as_ref().map_or(Lsn::NULL, |(_, end)| end.mapping_root))?;
    let mut redo = Redo::new(env);
    for (lsn, size, ln) in std::mem::take(&mut analysis.map_lns) {
        redo.apply(&ln, lsn, size, Some(&mut counting))?;
        run.redone += 1;
    }
    install_reserved(env)?;

    redo_pass(env, &mut redo, &analysis, start, &mut counting, &mut run)?;
    undo_pass(env, &analysis, &mut run)?;

    load_summaries(env)?;
    if !fresh_log {
        apply_counting(env, counting);
    }

    if let Some((end_lsn, end)) = &last {
        env.checkpointer.set_last(CheckpointInfo {
            id: end.id,
            start: end.ckpt_start,
            end: *end_lsn,
            first_active: end.first_active,
        });
    }

    if !env.config.read_only {
        run.orphans = delete_orphans(env)?;
        let needs_checkpoint = match &last {
            Some((end_lsn, _)) => env.log.last_entry_lsn() != *end_lsn,
            None => true,
        };
        if needs_checkpoint {
            checkpoint::run(env, true, "recovery")?;
        }
    }
    info!(
        entries = run.entries,
        redone = run.redone,
        undone = run.undone,
        committed = run.committed,
        uncommitted = run.uncommitted,
        orphans = run.orphans,
        "recovery finished"
    );
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Finding the start
// ------------------------------------------------------------------------------------------------

fn find_last_checkpoint(env: &EnvironmentImpl) -> Result<Option<(Lsn, CkptEndEntry)>, Error> {
    for entry in BackwardScanner::from_end(&env.log) {
        let entry = entry?;
        if entry.entry_type() != LogEntryType::CkptEnd {
            continue;
        }
        if let LogEntry::CkptEnd(end) = entry.decode()? {
            debug!(lsn = %entry.lsn, id = end.id, "found last checkpoint");
            return Ok(Some((entry.lsn, end)));
        }
    }
    Ok(None)
}

fn log_start(env: &EnvironmentImpl) -> Result<Lsn, Error> {
    let first = env
        .log
        .files()
        .list_files()?
        .first()
        .copied()
        .unwrap_or_else(|| env.log.current_file());
    Ok(Lsn::new(first, 0))
}

// ------------------------------------------------------------------------------------------------
// Analysis
// ------------------------------------------------------------------------------------------------

fn analyze(env: &EnvironmentImpl, from: Lsn, redo_start: Lsn, run: &mut RecoveryRun) -> Result<Analysis, Error> {
    let mut analysis = Analysis::default();
    for entry in ForwardScanner::new(&env.log, from, Lsn::NULL) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(LogError::FileNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        let lsn = entry.lsn;
        let size = entry.size();
        match entry.decode()? {
            LogEntry::Node(image) => {
                analysis.max_node_id = analysis.max_node_id.max(image.node_id);
                analysis.max_db_id = analysis.max_db_id.max(image.db_id);
            }
            LogEntry::Ln(ln) => {
                analysis.max_node_id = analysis.max_node_id.max(ln.ln_id);
                analysis.max_db_id = analysis.max_db_id.max(ln.db_id);
                if ln.kind == LnKind::Map {
                    if let Some(id) = id_from_bytes(&ln.key) {
                        analysis.max_db_id = analysis.max_db_id.max(id);
                    }
                }
                match &ln.txn {
                    Some(info) => {
                        analysis.max_txn_id = analysis.max_txn_id.max(info.txn_id);
                        analysis.txn_lns.push(TxnLn { lsn, size, ln });
                    }
                    None if ln.kind == LnKind::Map && lsn >= redo_start => {
                        analysis.map_lns.push((lsn, size, ln));
                    }
                    None => {}
                }
            }
            LogEntry::Commit(end) => {
                analysis.max_txn_id = analysis.max_txn_id.max(end.txn_id);
                analysis.committed.insert(end.txn_id, lsn);
            }
            LogEntry::Abort(end) => {
                analysis.max_txn_id = analysis.max_txn_id.max(end.txn_id);
                analysis.aborted.insert(end.txn_id, lsn);
            }
            LogEntry::CkptEnd(end) => {
                analysis.max_node_id = analysis.max_node_id.max(end.last_node_id);
                analysis.max_db_id = analysis.max_db_id.max(end.last_db_id);
                analysis.max_txn_id = analysis.max_txn_id.max(end.last_txn_id);
            }
            LogEntry::FileHeader(_) | LogEntry::CkptStart(_) => {}
        }
        run.entries += 1;
    }
    debug!(
        committed = analysis.committed.len(),
        aborted = analysis.aborted.len(),
        txn_records = analysis.txn_lns.len(),
        "analysis finished"
    );
    Ok(analysis)
}

// ------------------------------------------------------------------------------------------------
// Reserved databases
// ------------------------------------------------------------------------------------------------

fn reserved_config(env: &EnvironmentImpl) -> TreeConfig {
    TreeConfig {
        cmp: KeyComparator::bytes(),
        dup_cmp: KeyComparator::bytes(),
        node_max: env.config.node_max_entries,
        dup_node_max: env.config.dup_node_max_entries,
    }
}

fn install_mapping(env: &EnvironmentImpl, root: Lsn) -> Result<(), Error> {
    let tree = Tree::open(MAPPING_DB_ID, Arc::clone(&env.cache), reserved_config(env), root)?;
    env.install_db(Arc::new(DatabaseImpl::new(MAPPING_DB_ID, tree, false, false)));
    Ok(())
}

/// Opens the naming and utilization databases, creating them in a new
/// environment.
fn install_reserved(env: &EnvironmentImpl) -> Result<(), Error> {
    for (id, transactional) in [
        (NAMING_DB_ID, env.config.transactional),
        (UTILIZATION_DB_ID, false),
    ] {
        if let Some(record) = env.map_record(id)? {
            env.install_db(Arc::new(env.open_tree(id, &record)?));
            continue;
        }
        if env.config.read_only {
            return Err(RecoveryError::MissingReserved(id).into());
        }
        let tree = Tree::create(id, Arc::clone(&env.cache), reserved_config(env));
        let db = Arc::new(DatabaseImpl::new(id, tree, false, transactional));
        env.install_db(Arc::clone(&db));
        env.write_map_record(&db)?;
        debug!(db = id, "created reserved database");
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Redo
// ------------------------------------------------------------------------------------------------

/// How a replayed record met its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    /// The slot moved to the record; it held `old` before.
    Replaced { old: Lsn, old_deleted: bool },
    Inserted,
    /// The slot already holds the newer version at this LSN.
    Superseded(Lsn),
    /// A deletion of a slot that does not exist.
    Absent,
}

/// Replays records into the trees. Remembers duplicate counts logged
/// before their subtree exists.
struct Redo<'e> {
    env: &'e EnvironmentImpl,
    pending_counts: HashMap<(DatabaseId, Vec<u8>), DupCount>,
}

impl<'e> Redo<'e> {
    fn new(env: &'e EnvironmentImpl) -> Self {
        Self {
            env,
            pending_counts: HashMap::new(),
        }
    }

    /// Applies one record. With `counting`, the record is
    /// non-transactional and what it superseded is counted obsolete as of
    /// `lsn`.
    fn apply(&mut self, ln: &LnEntry, lsn: Lsn, size: u32, counting: Option<&mut Counting>) -> Result<(), Error> {
        let Some(db) = self.env.db(ln.db_id)? else {
            return Ok(());
        };
        let applied = match ln.kind {
            LnKind::DupCount => self.apply_count(&db, ln, lsn)?,
            LnKind::Data if db.sorted_duplicates => self.apply_dup(&db, ln, lsn)?,
            _ => apply_record(&db, Scope::Main, &ln.key, ln, lsn)?,
        };
        trace_applied(ln, lsn, applied);

        if ln.deleted && applied != Applied::Absent {
            let dup = (db.sorted_duplicates && ln.kind == LnKind::Data).then(|| ln.data.clone());
            self.env.compressor.enqueue(db.id, ln.key.clone(), dup);
        }
        let Some(counting) = counting else {
            return Ok(());
        };
        if ln.deleted {
            counting.obsolete.push((Obsolete::ln(lsn, Some(size), db.id), lsn));
        }
        match applied {
            Applied::Replaced { old, old_deleted } if !old.is_null() && !old_deleted => {
                counting.obsolete.push((Obsolete::ln(old, None, db.id), lsn));
            }
            Applied::Superseded(newer) if !ln.deleted => {
                counting
                    .obsolete
                    .push((Obsolete::ln(lsn, Some(size), db.id), newer));
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_dup(&mut self, db: &DbRef, ln: &LnEntry, lsn: Lsn) -> Result<Applied, Error> {
        if let Some(applied) = try_apply_record(db, Scope::Dup(&ln.key), &ln.data, ln, lsn)? {
            return Ok(applied);
        }
        if ln.deleted {
            return Ok(Applied::Absent);
        }
        // First record of a subtree the trees never saw.
        let count = self
            .pending_counts
            .remove(&(db.id, ln.key.clone()))
            .unwrap_or_else(|| DupCount {
                ln_id: self.env.cache.alloc_id(),
                lsn: Lsn::NULL,
                count: 0,
            });
        let first = Slot::record(ln.data.clone(), lsn, ln.ln_id, None);
        db.tree
            .modify(Scope::Main, &ln.key, true, |edit| -> Result<(), Error> {
                if edit.slot().is_some() {
                    return Err(RecoveryError::DupConflict { db: db.id }.into());
                }
                edit.insert_dup_tree(ln.key.clone(), count, first)?;
                Ok(())
            })?
            .transpose()?;
        Ok(Applied::Inserted)
    }

    fn apply_count(&mut self, db: &DbRef, ln: &LnEntry, lsn: Lsn) -> Result<Applied, Error> {
        let value = count_value(ln, lsn)?;
        let applied = db.tree.modify(Scope::Main, &ln.key, false, |edit| {
            let Some(slot) = edit.slot_mut() else {
                return Applied::Absent;
            };
            let Target::DupTree { count, .. } = &mut slot.target else {
                return Applied::Absent;
            };
            if !lsn.newer_than(count.lsn) {
                return Applied::Superseded(count.lsn);
            }
            let old = count.lsn;
            *count = DupCount {
                ln_id: ln.ln_id,
                lsn,
                count: value,
            };
            Applied::Replaced {
                old,
                old_deleted: false,
            }
        })?;
        let applied = applied.unwrap_or(Applied::Absent);
        if applied == Applied::Absent {
            let pending = self
                .pending_counts
                .entry((db.id, ln.key.clone()))
                .or_insert(DupCount {
                    ln_id: ln.ln_id,
                    lsn: Lsn::NULL,
                    count: 0,
                });
            if lsn.newer_than(pending.lsn) {
                *pending = DupCount {
                    ln_id: ln.ln_id,
                    lsn,
                    count: value,
                };
            }
            return Ok(Applied::Replaced {
                old: Lsn::NULL,
                old_deleted: true,
            });
        }
        Ok(applied)
    }
}

fn count_value(ln: &LnEntry, lsn: Lsn) -> Result<u64, Error> {
    let bytes: [u8; 8] = ln
        .data
        .as_slice()
        .try_into()
        .map_err(|_| RecoveryError::BadCount(lsn))?;
    Ok(u64::from_be_bytes(bytes))
}

fn apply_record(db: &DbRef, scope: Scope<'_>, slot_key: &[u8], ln: &LnEntry, lsn: Lsn) -> Result<Applied, Error> {
    Ok(try_apply_record(db, scope, slot_key, ln, lsn)?.unwrap_or(Applied::Absent))
}

/// `None` when a duplicate scope has no subtree.
fn try_apply_record(
    db: &DbRef,
    scope: Scope<'_>,
    slot_key: &[u8],
    ln: &LnEntry,
    lsn: Lsn,
) -> Result<Option<Applied>, Error> {
    let applied = db.tree.modify(scope, slot_key, !ln.deleted, |edit| -> Result<Applied, Error> {
        match edit.slot_mut() {
            Some(slot) => {
                if !lsn.newer_than(slot.lsn) {
                    return Ok(Applied::Superseded(slot.lsn));
                }
                let old = slot.lsn;
                let old_deleted = slot.is_deleted();
                slot.lsn = lsn;
                slot.key = slot_key.to_vec();
                slot.target = Target::Record {
                    ln_id: ln.ln_id,
                    deleted: ln.deleted,
                    data: None,
                };
                Ok(Applied::Replaced { old, old_deleted })
            }
            None if ln.deleted => Ok(Applied::Absent),
            None => {
                edit.insert(Slot::record(slot_key.to_vec(), lsn, ln.ln_id, None))?;
                Ok(Applied::Inserted)
            }
        }
    })?;
    applied.transpose()
}

fn trace_applied(ln: &LnEntry, lsn: Lsn, applied: Applied) {
    trace!(db = ln.db_id, ln = ln.ln_id, %lsn, kind = ln.kind.entry_type().name(), ?applied, "redo");
}

fn redo_pass(
    env: &EnvironmentImpl,
    redo: &mut Redo<'_>,
    analysis: &Analysis,
    start: Lsn,
    counting: &mut Counting,
    run: &mut RecoveryRun,
) -> Result<(), Error> {
    for entry in ForwardScanner::new(&env.log, start, Lsn::NULL) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(LogError::FileNotFound(_)) => continue,
            Err(e) => return Err(e.into()),
        };
        let lsn = entry.lsn;
        let size = entry.size();
        let ty = entry.entry_type();
        let decoded = entry.decode()?;
        counting.new.push((lsn, ty, size, decoded.db_id()));
        match decoded {
            LogEntry::Node(image) if !image.prev_logged.is_null() => {
                counting
                    .obsolete
                    .push((Obsolete::node(image.prev_logged, image.db_id), lsn));
            }
            // Already replayed before the trees were opened.
            LogEntry::Ln(ln) if ln.kind == LnKind::Map => {}
            LogEntry::Ln(ln) => match &ln.txn {
                None => {
                    redo.apply(&ln, lsn, size, Some(&mut *counting))?;
                    run.redone += 1;
                }
                Some(info) => {
                    if let Outcome::Committed(_) = analysis.outcome(info.txn_id) {
                        redo.apply(&ln, lsn, size, None)?;
                        run.redone += 1;
                    }
                }
            },
            _ => {}
        }
    }

    // Transactional records count by their abort information, whatever the
    // trees looked like.
    for record in &analysis.txn_lns {
        let Some(info) = &record.ln.txn else {
            continue;
        };
        let db_id = record.ln.db_id;
        let own = Obsolete::ln(record.lsn, Some(record.size), db_id);
        match analysis.outcome(info.txn_id) {
            Outcome::Committed(commit) => {
                if !info.abort_lsn.is_null() && !info.abort_deleted {
                    counting
                        .obsolete
                        .push((Obsolete::ln(info.abort_lsn, None, db_id), commit));
                }
                if record.ln.deleted {
                    counting.obsolete.push((own, commit));
                }
            }
            Outcome::Aborted(abort) => counting.obsolete.push((own, abort)),
            // Never counted before the crash.
            Outcome::Open => counting.obsolete.push((own, Lsn::NULL)),
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Undo
// ------------------------------------------------------------------------------------------------

fn undo_pass(env: &EnvironmentImpl, analysis: &Analysis, run: &mut RecoveryRun) -> Result<(), Error> {
    let mut open = HashSet::new();
    for record in analysis.txn_lns.iter().rev() {
        let Some(info) = &record.ln.txn else {
            continue;
        };
        match analysis.outcome(info.txn_id) {
            Outcome::Committed(_) => {
                run.committed += u64::from(open.insert((true, info.txn_id)));
                continue;
            }
            Outcome::Aborted(_) => {}
            Outcome::Open => {
                run.uncommitted += u64::from(open.insert((false, info.txn_id)));
            }
        }
        if undo_record(env, record)? {
            run.undone += 1;
        }
    }
    Ok(())
}

/// Restores one slot if it still carries the record. Returns whether it
/// did.
fn undo_record(env: &EnvironmentImpl, record: &TxnLn) -> Result<bool, Error> {
    let ln = &record.ln;
    let Some(info) = &ln.txn else {
        return Ok(false);
    };
    let Some(db) = env.db(ln.db_id)? else {
        return Ok(false);
    };
    let lsn = record.lsn;

    if ln.kind == LnKind::DupCount {
        let restored = db.tree.modify(Scope::Main, &ln.key, false, |edit| -> Result<bool, Error> {
            let Some(Slot {
                target: Target::DupTree { count, .. },
                ..
            }) = edit.slot_mut()
            else {
                return Ok(false);
            };
            if count.ln_id != ln.ln_id || count.lsn != lsn {
                return Ok(false);
            }
            count.count = prior_count(env, info.abort_lsn)?;
            count.lsn = info.abort_lsn;
            Ok(true)
        })?;
        return Ok(restored.transpose()?.unwrap_or(false));
    }

    let dup = db.sorted_duplicates && ln.kind == LnKind::Data;
    let (scope, slot_key) = if dup {
        (Scope::Dup(&ln.key), ln.data.as_slice())
    } else {
        (Scope::Main, ln.key.as_slice())
    };
    let restored = db.tree.modify(scope, slot_key, false, |edit| {
        let Some(slot) = edit.slot_mut() else {
            return None;
        };
        if slot.ln_id() != Some(ln.ln_id) || slot.lsn != lsn {
            return None;
        }
        slot.lsn = info.abort_lsn;
        if let Some(key) = &info.abort_key {
            slot.key = key.clone();
        }
        let gone = info.abort_deleted || info.abort_lsn.is_null();
        if let Target::Record { deleted, data, .. } = &mut slot.target {
            *deleted = gone;
            *data = None;
        }
        Some(gone)
    })?;
    let Some(Some(gone)) = restored else {
        return Ok(false);
    };
    if gone {
        let dup = dup.then(|| ln.data.clone());
        env.compressor.enqueue(db.id, ln.key.clone(), dup);
    }
    Ok(true)
}

/// Count held by the DupCountLN at `lsn`; zero for a subtree that did not
/// exist.
fn prior_count(env: &EnvironmentImpl, lsn: Lsn) -> Result<u64, Error> {
    if lsn.is_null() {
        return Ok(0);
    }
    match env.log.read_entry(lsn)? {
        LogEntry::Ln(ln) if ln.kind == LnKind::DupCount => count_value(&ln, lsn),
        other => Err(Error::RunRecovery(format!(
            "expected a duplicate count at {lsn}, found {}",
            other.entry_type().name()
        ))),
    }
}

// ------------------------------------------------------------------------------------------------
// Utilization
// ------------------------------------------------------------------------------------------------

fn load_summaries(env: &EnvironmentImpl) -> Result<(), Error> {
    let util = env.reserved(UTILIZATION_DB_ID)?;
    let current = env.log.current_file();
    let mut loaded = 0;
    let mut next = util.tree.seek(Scope::Main, Seek::First)?;
    while let Some(view) = next {
        if let Some(file) = file_from_summary_key(&view.key) {
            let exists = file == current || env.log.files().exists(file);
            if !view.is_deleted() && exists {
                let record = SummaryRecord::from_bytes(&env.record_data(&view)?)?;
                env.tracker.load(file, record, view.lsn);
                loaded += 1;
            }
        }
        next = util.tree.seek(Scope::Main, Seek::Gt(&view.key))?;
    }
    debug!(loaded, "loaded file summaries");
    Ok(())
}

fn apply_counting(env: &EnvironmentImpl, counting: Counting) {
    let current = env.log.current_file();
    let exists = |file: u32| file == current || env.log.files().exists(file);
    for (lsn, ty, size, db) in counting.new {
        env.tracker.count_new_if_uncounted(lsn, ty, size, db);
    }
    for (obsolete, cause) in counting.obsolete {
        if exists(obsolete.lsn.file()) {
            env.tracker.count_obsolete_if_uncounted(&obsolete, cause);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unnamed databases
// ------------------------------------------------------------------------------------------------

/// Deletes user databases that no name refers to: created by a
/// transaction that never committed, or replaced by a committed truncate
/// or remove whose cleanup the crash interrupted.
fn delete_orphans(env: &EnvironmentImpl) -> Result<u64, Error> {
    let named: HashSet<DatabaseId> = env.named_ids()?.into_iter().collect();
    let mapping = env.reserved(MAPPING_DB_ID)?;
    let mut orphans = Vec::new();
    let mut next = mapping.tree.seek(Scope::Main, Seek::First)?;
    while let Some(view) = next {
        if let Some(id) = id_from_bytes(&view.key) {
            if !view.is_deleted() && !is_reserved(id) && !named.contains(&id) {
                orphans.push(id);
            }
        }
        next = mapping.tree.seek(Scope::Main, Seek::Gt(&view.key))?;
    }
    for &id in &orphans {
        match env.delete_db_contents(id) {
            Ok(()) => info!(db = id, "deleted unnamed database"),
            Err(e) => warn!(db = id, error = %e, "could not delete unnamed database"),
        }
    }
    Ok(orphans.len() as u64)
}
