//! Processing one file: every entry is either found obsolete or moved.
//!
//! A record entry is live when the slot for its key still carries its LSN.
//! Live records are appended again and the slot is pointed at the copy.
//! A record is read-locked before the check, so an uncommitted write whose
//! abort would bring the entry back keeps the file from being cleaned.
//!
//! A node entry is live when its parent slot (or the tree, for a main
//! root) still carries its LSN. Live nodes are not copied here; they are
//! marked dirty and the next checkpoint logs them at the end of the log.
//!
//! Entries of a database whose deletion is running are obsolete, and their
//! file waits for that deletion to finish before it can be deleted.
//!
//! FileSummaryLNs are rewritten by the checkpoint from the tracker, never
//! copied, so a live one only marks its file's summary dirty.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, trace};

use crate::env::EnvironmentImpl;
use crate::env::dbtree::{DbRef, UTILIZATION_DB_ID};
use crate::log::entry::{LnEntry, LnKind, LogEntry, NodeImage};
use crate::log::scanner::ForwardScanner;
use crate::log::{LogError, Lsn};
use crate::tree::latch::ExclusiveLatch;
use crate::tree::node::Target;
use crate::tree::{NodeSpec, Scope};
use crate::txn::Locker;
use crate::txn::lock::{LockError, LockGrant, LockId, LockType};
use crate::Error;

use super::{Obsolete, file_from_summary_key};

/// What processing one file did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CleanRun {
    pub migrated: u64,
    pub obsolete: u64,
    pub locked: u64,
    pub dirtied: u64,
    pub ins_obsolete: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileOutcome {
    /// Nothing live is left in the file.
    Cleaned(CleanRun),
    /// Some records were locked; the file must be processed again later.
    Deferred { locked: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LnOutcome {
    Migrated,
    Obsolete,
    Locked,
}

/// Migrates the live entries of `file`.
///
/// # Errors
///
/// Log errors other than a missing file, and tree errors.
pub(crate) fn process_file(env: &EnvironmentImpl, file: u32) -> Result<FileOutcome, Error> {
    let mut run = CleanRun::default();
    for entry in ForwardScanner::over_file(&env.log, file) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(LogError::FileNotFound(_)) => {
                debug!(file, "log file vanished before it was cleaned");
                break;
            }
            Err(e) => return Err(e.into()),
        };
        env.io.update_reads(1);
        let ty = entry.entry_type();
        if ty.is_node() {
            if let LogEntry::Node(image) = entry.decode()? {
                if dirty_if_live(env, &image, entry.lsn)? {
                    run.dirtied += 1;
                } else {
                    run.ins_obsolete += 1;
                }
            }
        } else if ty.is_ln() {
            if let LogEntry::Ln(ln) = entry.decode()? {
                match migrate_ln(env, ln, entry.lsn, entry.size())? {
                    LnOutcome::Migrated => run.migrated += 1,
                    LnOutcome::Obsolete => run.obsolete += 1,
                    LnOutcome::Locked => run.locked += 1,
                }
            }
        }
        // No latch or lock is held between entries.
        env.io.sleep_after_background_io();
    }

    let counters = &env.cleaner.counters;
    counters.lns_migrated.fetch_add(run.migrated, Ordering::Relaxed);
    counters.lns_obsolete.fetch_add(run.obsolete, Ordering::Relaxed);
    counters.lns_locked.fetch_add(run.locked, Ordering::Relaxed);
    counters.ins_dirtied.fetch_add(run.dirtied, Ordering::Relaxed);
    counters.ins_obsolete.fetch_add(run.ins_obsolete, Ordering::Relaxed);
    if run.locked > 0 {
        return Ok(FileOutcome::Deferred { locked: run.locked });
    }
    Ok(FileOutcome::Cleaned(run))
}

// ------------------------------------------------------------------------------------------------
// Nodes
// ------------------------------------------------------------------------------------------------

/// Marks the node logged at `lsn` dirty if the tree still refers to that
/// version. Returns whether it did.
fn dirty_if_live(env: &EnvironmentImpl, image: &NodeImage, lsn: Lsn) -> Result<bool, Error> {
    let Some(db) = env.db(image.db_id)? else {
        return Ok(false);
    };
    if db.is_deleted() || env.cleaner.wait_if_pending(lsn.file(), db.id) {
        return Ok(false);
    }
    let spec = NodeSpec::from_image(image);
    if spec.root && spec.dup_key.is_none() {
        return Ok(db.tree.with_root(|root| {
            let live = root.id == spec.id && root.last_logged == lsn;
            if live {
                root.dirty = true;
            }
            live
        }));
    }
    let dirtied = db.tree.with_parent(&spec, |parent| -> Result<bool, Error> {
        if parent.slot().lsn != lsn {
            return Ok(false);
        }
        let child = parent.load_child()?;
        let budget = Arc::clone(parent.budget());
        let mut child = ExclusiveLatch::acquire(&child, &budget);
        child.dirty = true;
        trace!(db = spec.db_id, node = child.id, %lsn, "dirtied live node");
        Ok(true)
    })?;
    Ok(dirtied.transpose()?.unwrap_or(false))
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

fn migrate_ln(env: &EnvironmentImpl, ln: LnEntry, lsn: Lsn, size: u32) -> Result<LnOutcome, Error> {
    if ln.kind == LnKind::FileSummary {
        return summary_ln(env, &ln, lsn);
    }
    let Some(db) = env.db(ln.db_id)? else {
        return Ok(LnOutcome::Obsolete);
    };
    if db.is_deleted() || env.cleaner.wait_if_pending(lsn.file(), db.id) {
        return Ok(LnOutcome::Obsolete);
    }
    let locker = env.txns.basic_locker();
    let id = LockId::Record(ln.ln_id);
    if !lock_for_cleaning(env, &locker, id)? {
        trace!(db = db.id, ln = ln.ln_id, %lsn, "record locked, deferring file");
        return Ok(LnOutcome::Locked);
    }
    let outcome = relocate(env, &db, ln, lsn, size);
    locker.release(id);
    outcome
}

/// Read-locks a record for the cleaner, with the cleaner lock timeout and
/// retries.
fn lock_for_cleaning(env: &EnvironmentImpl, locker: &Locker, id: LockId) -> Result<bool, Error> {
    Ok(lock_with_retries(
        locker,
        id,
        env.config.cleaner_lock_timeout,
        env.config.cleaner_deadlock_retry,
    ))
}

/// Read-locks `id`, trying `retries` more times after a deadlock or a
/// timeout. Returns false when every attempt failed.
pub(super) fn lock_with_retries(
    locker: &Locker,
    id: LockId,
    timeout: Duration,
    retries: u32,
) -> bool {
    let mut attempts = 0;
    loop {
        match locker.lock_with_timeout(id, LockType::Read, timeout) {
            Ok(LockGrant::Denied) | Err(LockError::NotGranted { .. }) => return false,
            Ok(_) => return true,
            Err(e @ (LockError::Deadlock { .. } | LockError::Timeout { .. })) => {
                if attempts >= retries {
                    trace!(%id, attempts, error = %e, "cleaner gave up on a locked record");
                    return false;
                }
                attempts += 1;
            }
        }
    }
}

/// Appends a live record again and points its slot at the copy.
fn relocate(env: &EnvironmentImpl, db: &DbRef, mut ln: LnEntry, lsn: Lsn, size: u32) -> Result<LnOutcome, Error> {
    let obsolete = [Obsolete::ln(lsn, Some(size), db.id)];
    let ln_id = ln.ln_id;
    // The record is read-locked, so no transaction has it open.
    ln.txn = None;

    if ln.kind == LnKind::DupCount {
        let key = ln.key.clone();
        let moved = db.tree.modify(Scope::Main, &key, false, |edit| -> Result<bool, Error> {
            let live = matches!(
                edit.slot().map(|s| &s.target),
                Some(Target::DupTree { count, .. }) if count.ln_id == ln_id && count.lsn == lsn
            );
            if !live {
                return Ok(false);
            }
            let (moved_to, _) = env.log.append_obsoleting(&LogEntry::Ln(ln), false, &obsolete)?;
            if let Some(count) = edit.slot_mut().and_then(|slot| match &mut slot.target {
                Target::DupTree { count, .. } => Some(count),
                _ => None,
            }) {
                count.lsn = moved_to;
            }
            Ok(true)
        })?;
        return Ok(outcome_of(moved.transpose()?.unwrap_or(false)));
    }

    let key = ln.key.clone();
    let dup = (db.sorted_duplicates && ln.kind == LnKind::Data).then(|| ln.data.clone());
    let (scope, slot_key) = match &dup {
        Some(data) => (Scope::Dup(&key), data.as_slice()),
        None => (Scope::Main, key.as_slice()),
    };
    let moved = db.tree.modify(scope, slot_key, false, |edit| -> Result<bool, Error> {
        let live = edit
            .slot()
            .is_some_and(|s| s.ln_id() == Some(ln_id) && s.lsn == lsn && !s.is_deleted());
        if !live {
            return Ok(false);
        }
        let (moved_to, _) = env.log.append_obsoleting(&LogEntry::Ln(ln), false, &obsolete)?;
        if let Some(slot) = edit.slot_mut() {
            slot.lsn = moved_to;
        }
        Ok(true)
    })?;
    Ok(outcome_of(moved.transpose()?.unwrap_or(false)))
}

fn outcome_of(moved: bool) -> LnOutcome {
    if moved {
        LnOutcome::Migrated
    } else {
        LnOutcome::Obsolete
    }
}

fn summary_ln(env: &EnvironmentImpl, ln: &LnEntry, lsn: Lsn) -> Result<LnOutcome, Error> {
    let util = env.reserved(UTILIZATION_DB_ID)?;
    let live = util
        .tree
        .get(Scope::Main, &ln.key)?
        .is_some_and(|view| view.lsn == lsn && !view.is_deleted());
    if !live {
        return Ok(LnOutcome::Obsolete);
    }
    let Some(file) = file_from_summary_key(&ln.key) else {
        return Ok(LnOutcome::Obsolete);
    };
    if env.tracker.summary(file).is_none() {
        // Summary of a deleted file; the next checkpoint drops it.
        return Ok(LnOutcome::Obsolete);
    }
    env.tracker.mark_dirty(file);
    Ok(LnOutcome::Migrated)
}
