//! Checkpoints.
//!
//! A checkpoint bounds recovery: it logs every dirty node bottom-up so the
//! last CkptEnd names a mapping root from which every tree can be rebuilt,
//! and recovery only replays entries logged after the matching CkptStart.
//!
//! One checkpoint, in order:
//!
//! 1. CkptStart, and the files the cleaner finished become deletable.
//! 2. FileSummaryLNs of deleted files are dropped, dirty summaries written.
//! 3. Dirty nodes of every tree except the mapping tree are logged, lowest
//!    level first, non-root nodes provisionally. Logging a node dirties
//!    its parent, which joins the work at its own level.
//! 4. MapLNs of databases whose root moved are rewritten.
//! 5. The mapping tree is flushed the same way.
//! 6. CkptEnd is appended and the log is fsynced.
//! 7. Deletable files are removed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cleaner::{CleanerError, Obsolete, summary_key, file_from_summary_key};
use crate::env::EnvironmentImpl;
use crate::env::dbtree::{DbRef, MAPPING_DB_ID, UTILIZATION_DB_ID};
use crate::log::Lsn;
use crate::log::entry::{CkptEndEntry, CkptStartEntry, LnEntry, LnKind, LogEntry, now_ms};
use crate::tree::latch::{ExclusiveLatch, SharedLatch};
use crate::tree::node::{Slot, Target};
use crate::tree::{NodeSpec, Scope, Seek};
use crate::{DatabaseId, Error};

/// Where the last complete checkpoint sits in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CheckpointInfo {
    pub id: u64,
    pub start: Lsn,
    pub end: Lsn,
    pub first_active: Lsn,
}

/// Checkpointer statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub checkpoints: u64,
    pub last_id: u64,
    pub last_start: Lsn,
    pub last_end: Lsn,
    pub nodes_flushed: u64,
    pub summaries_flushed: u64,
    pub map_records_flushed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    checkpoints: AtomicU64,
    nodes_flushed: AtomicU64,
    summaries_flushed: AtomicU64,
    map_records_flushed: AtomicU64,
}

pub(crate) struct Checkpointer {
    run_lock: Mutex<()>,
    in_progress: AtomicBool,
    last: Mutex<Option<CheckpointInfo>>,
    /// Log size when the last checkpoint ended.
    last_bytes: AtomicU64,
    counters: Counters,
}

impl Checkpointer {
    pub fn new() -> Self {
        Self {
            run_lock: Mutex::new(()),
            in_progress: AtomicBool::new(false),
            last: Mutex::new(None),
            last_bytes: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn last(&self) -> Option<CheckpointInfo> {
        *self.last.lock()
    }

    /// Records the checkpoint recovery started from.
    pub fn set_last(&self, info: CheckpointInfo) {
        *self.last.lock() = Some(info);
    }

    /// True when the log grew by at least `interval` bytes since the last
    /// checkpoint.
    pub fn bytes_interval_elapsed(&self, log_bytes: u64, interval: u64) -> bool {
        log_bytes.saturating_sub(self.last_bytes.load(Ordering::Relaxed)) >= interval
    }

    pub fn stats(&self, clear: bool) -> CheckpointStats {
        let load = |c: &AtomicU64| {
            if clear {
                c.swap(0, Ordering::Relaxed)
            } else {
                c.load(Ordering::Relaxed)
            }
        };
        let last = self.last();
        CheckpointStats {
            checkpoints: load(&self.counters.checkpoints),
            last_id: last.map_or(0, |l| l.id),
            last_start: last.map_or(Lsn::NULL, |l| l.start),
            last_end: last.map_or(Lsn::NULL, |l| l.end),
            nodes_flushed: load(&self.counters.nodes_flushed),
            summaries_flushed: load(&self.counters.summaries_flushed),
            map_records_flushed: load(&self.counters.map_records_flushed),
        }
    }
}

struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ------------------------------------------------------------------------------------------------
// Runs
// ------------------------------------------------------------------------------------------------

/// Runs a checkpoint. Without `force`, nothing happens unless the log grew
/// by the checkpointer bytes interval since the last one. Returns whether
/// a checkpoint was written.
///
/// # Errors
///
/// `RunRecovery` when the environment is invalid; log and tree errors,
/// which invalidate it.
pub(crate) fn run(env: &EnvironmentImpl, force: bool, invoker: &str) -> Result<bool, Error> {
    if env.config.read_only {
        return Ok(false);
    }
    if let Some(reason) = env.validity.invalid_reason() {
        return Err(Error::RunRecovery(reason));
    }
    let ckpt = &env.checkpointer;
    let _running = ckpt.run_lock.lock();
    if !force
        && !ckpt.bytes_interval_elapsed(env.log.bytes_written(), env.config.checkpointer_bytes_interval)
    {
        return Ok(false);
    }
    ckpt.in_progress.store(true, Ordering::Release);
    let _in_progress = InProgress(&ckpt.in_progress);
    env.guard(checkpoint(env, invoker))?;
    Ok(true)
}

fn checkpoint(env: &EnvironmentImpl, invoker: &str) -> Result<(), Error> {
    let ckpt = &env.checkpointer;
    let id = ckpt.last().map_or(1, |l| l.id + 1);
    let first_active = env.txns.first_active_lsn();
    let start = env.log.append(
        &LogEntry::CkptStart(CkptStartEntry {
            id,
            invoker: invoker.to_string(),
            time_ms: now_ms(),
        }),
        false,
    )?;
    let deletable = env.cleaner.checkpoint_started();
    debug!(id, %start, invoker, deletable = deletable.len(), "checkpoint started");

    drop_stale_summaries(env)?;
    let summaries = flush_summaries(env)?;

    let others: Vec<DbRef> = env
        .databases()
        .into_iter()
        .filter(|db| db.id != MAPPING_DB_ID && !db.is_deleted())
        .collect();
    let mut nodes = 0;
    for db in &others {
        nodes += flush_tree(env, db)?;
    }
    let maps = flush_map_records(env, &others)?;
    let mapping = env.reserved(MAPPING_DB_ID)?;
    nodes += flush_tree(env, &mapping)?;
    let mapping_root = mapping.tree.root_lsn();

    let end = env.log.append(
        &LogEntry::CkptEnd(CkptEndEntry {
            id,
            ckpt_start: start,
            first_active,
            mapping_root,
            last_node_id: env.cache.last_id(),
            last_db_id: env.last_db_id(),
            last_txn_id: env.txns.last_id(),
            time_ms: now_ms(),
        }),
        false,
    )?;
    env.log.flush(true)?;
    ckpt.set_last(CheckpointInfo {
        id,
        start,
        end,
        first_active,
    });
    ckpt.last_bytes.store(env.log.bytes_written(), Ordering::Relaxed);

    if !deletable.is_empty() {
        delete_cleaned_files(env, &deletable);
    }

    let counters = &ckpt.counters;
    counters.checkpoints.fetch_add(1, Ordering::Relaxed);
    counters.nodes_flushed.fetch_add(nodes, Ordering::Relaxed);
    counters.summaries_flushed.fetch_add(summaries, Ordering::Relaxed);
    counters.map_records_flushed.fetch_add(maps, Ordering::Relaxed);
    info!(id, %start, %end, nodes, summaries, maps, invoker, "checkpoint finished");
    Ok(())
}

/// Deletes the files the cleaner finished before this checkpoint, except
/// those an open backup includes. Nothing is deleted while a read-only
/// environment holds the directory lock; the files stay checkpointed.
fn delete_cleaned_files(env: &EnvironmentImpl, files: &[u32]) {
    let kept = env.cleaner.with_unpinned(files, |unpinned| {
        if unpinned.is_empty() {
            return Ok(Some(()));
        }
        env.dir_lock.with_exclusive(|| {
            for &file in unpinned {
                match env.log.files().delete_file(file) {
                    Ok(()) => {
                        env.tracker.remove_file(file);
                        env.cleaner.file_deleted(file);
                    }
                    Err(e) => {
                        let e = CleanerError::Delete {
                            file,
                            reason: e.to_string(),
                        };
                        warn!(error = %e, "cleaned file kept");
                    }
                }
            }
        })
    });
    match kept {
        Ok(Some(())) => {}
        Ok(None) => debug!(files = files.len(), "cleaned files kept while a reader holds the log"),
        Err(e) => warn!(error = %e, "could not take the environment lock, cleaned files kept"),
    }
}

// ------------------------------------------------------------------------------------------------
// Utilization summaries
// ------------------------------------------------------------------------------------------------

/// Removes the FileSummaryLNs of files that no longer exist.
fn drop_stale_summaries(env: &EnvironmentImpl) -> Result<(), Error> {
    let util = env.reserved(UTILIZATION_DB_ID)?;
    let current = env.log.current_file();
    let mut stale = Vec::new();
    let mut next = util.tree.seek(Scope::Main, Seek::First)?;
    while let Some(view) = next {
        if let Some(file) = file_from_summary_key(&view.key) {
            if !view.is_deleted() && file < current && !env.log.files().exists(file) {
                stale.push(view.key.clone());
            }
        }
        next = util.tree.seek(Scope::Main, Seek::Gt(&view.key))?;
    }
    for key in stale {
        util.tree.modify(Scope::Main, &key, false, |edit| -> Result<(), Error> {
            let Some(ln_id) = edit.slot().and_then(Slot::ln_id) else {
                return Ok(());
            };
            // The old version lived in a deleted file, so nothing is counted
            // against it.
            let entry = LogEntry::Ln(LnEntry {
                kind: LnKind::FileSummary,
                db_id: UTILIZATION_DB_ID,
                ln_id,
                key: key.clone(),
                data: Vec::new(),
                deleted: true,
                txn: None,
            });
            env.log.append_dead(&entry, &[])?;
            edit.remove();
            Ok(())
        })?
        .transpose()?;
        if let Some(file) = file_from_summary_key(&key) {
            env.tracker.remove_file(file);
            debug!(file, "dropped summary of deleted file");
        }
    }
    Ok(())
}

/// Persists the summary of every file whose counters changed.
fn flush_summaries(env: &EnvironmentImpl) -> Result<u64, Error> {
    let util = env.reserved(UTILIZATION_DB_ID)?;
    let current = env.log.current_file();
    let mut written = 0;
    for file in env.tracker.dirty_files() {
        if file < current && !env.log.files().exists(file) {
            env.tracker.remove_file(file);
            continue;
        }
        if env.tracker.summary(file).is_none() {
            continue;
        }
        persist_summary(env, &util, file)?;
        written += 1;
    }
    Ok(written)
}

/// Writes one FileSummaryLN. The snapshot is taken under the log write
/// lock, so the summary describes the file exactly up to the entry that
/// holds it.
fn persist_summary(env: &EnvironmentImpl, util: &DbRef, file: u32) -> Result<(), Error> {
    let key = summary_key(file);
    let tracker = &env.tracker;
    util.tree
        .modify(Scope::Main, &key, true, |edit| -> Result<(), Error> {
            let prior = edit.slot().map(|s| (s.ln_id(), s.lsn, s.is_deleted()));
            let ln_id = match prior {
                Some((Some(id), _, _)) => id,
                _ => env.cache.alloc_id(),
            };
            let obsolete: Vec<Obsolete> = prior
                .filter(|&(_, lsn, deleted)| {
                    !lsn.is_null() && !deleted && env.log.files().exists(lsn.file())
                })
                .map(|(_, lsn, _)| Obsolete::ln(lsn, None, UTILIZATION_DB_ID))
                .into_iter()
                .collect();
            let (lsn, _, _) = env.log.append_built(
                &obsolete,
                || {
                    let record = tracker.snapshot_for_persist(file).unwrap_or_default();
                    Ok(LogEntry::Ln(LnEntry {
                        kind: LnKind::FileSummary,
                        db_id: UTILIZATION_DB_ID,
                        ln_id,
                        key: key.clone(),
                        data: record.to_bytes()?,
                        deleted: false,
                        txn: None,
                    }))
                },
                |lsn| {
                    tracker.persisted(file, lsn);
                    // Counting the new entry, or the old one it replaces,
                    // changed the file after the snapshot.
                    if lsn.file() == file || obsolete.iter().any(|o| o.lsn.file() == file) {
                        tracker.mark_dirty(file);
                    }
                },
            )?;
            match edit.slot_mut() {
                Some(slot) => {
                    slot.lsn = lsn;
                    if let Target::Record { deleted, data, .. } = &mut slot.target {
                        *deleted = false;
                        *data = None;
                    }
                }
                None => edit.insert(Slot::record(key.clone(), lsn, ln_id, None))?,
            }
            Ok(())
        })?
        .transpose()?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Trees
// ------------------------------------------------------------------------------------------------

/// Flush order: duplicate subtrees before the main tree, lower levels
/// first.
type Rank = (bool, u16);

fn rank(spec: &NodeSpec) -> Rank {
    (spec.dup_key.is_none(), spec.level)
}

/// Dirty resident nodes, grouped by database.
fn dirty_nodes(env: &EnvironmentImpl) -> HashMap<DatabaseId, Vec<NodeSpec>> {
    let mut dirty: HashMap<DatabaseId, Vec<NodeSpec>> = HashMap::new();
    for node in env.cache.resident() {
        let node = SharedLatch::acquire(&node);
        if node.dirty && !node.detached {
            dirty.entry(node.db_id).or_default().push(NodeSpec::of(&node));
        }
    }
    dirty
}

/// Logs every dirty node of one tree and the path above it. Returns the
/// number of nodes logged.
fn flush_tree(env: &EnvironmentImpl, db: &DbRef) -> Result<u64, Error> {
    let specs = dirty_nodes(env).remove(&db.id).unwrap_or_default();
    let mut work: BTreeMap<Rank, Vec<NodeSpec>> = BTreeMap::new();
    let mut queued = HashSet::new();
    for spec in specs {
        if queued.insert(spec.id) {
            work.entry(rank(&spec)).or_default().push(spec);
        }
    }

    let mut flushed = 0;
    while let Some((_, level)) = work.pop_first() {
        for spec in level {
            let (logged, parent) = flush_node(env, db, &spec)?;
            if logged {
                flushed += 1;
                env.io.update_writes(1);
            }
            if let Some(parent) = parent {
                if queued.insert(parent.id) {
                    work.entry(rank(&parent)).or_default().push(parent);
                }
            }
            env.io.sleep_after_background_io();
        }
    }
    if flushed > 0 {
        debug!(db = db.id, flushed, root = %db.tree.root_lsn(), "flushed tree");
    }
    Ok(flushed)
}

/// Logs one dirty node and records its LSN in the parent. Returns whether
/// it logged, and the parent to flush next.
fn flush_node(env: &EnvironmentImpl, db: &DbRef, spec: &NodeSpec) -> Result<(bool, Option<NodeSpec>), Error> {
    if spec.root && spec.dup_key.is_none() {
        let logged = db.tree.with_root(|root| -> Result<bool, Error> {
            if root.id != spec.id || !root.dirty {
                return Ok(false);
            }
            env.log_node(root, false)?;
            Ok(true)
        })?;
        return Ok((logged, None));
    }
    let result = db.tree.with_parent(spec, |parent| -> Result<(bool, Option<NodeSpec>), Error> {
        let Some(child) = parent.resident_child() else {
            return Ok((false, None));
        };
        let budget = Arc::clone(parent.budget());
        let mut child = ExclusiveLatch::acquire(&child, &budget);
        if child.id != spec.id || child.detached || !child.dirty {
            return Ok((false, None));
        }
        let lsn = env.log_node(&mut child, true)?;
        parent.set_child_lsn(lsn);
        Ok((true, Some(parent.parent_spec())))
    })?;
    Ok(result.transpose()?.unwrap_or((false, None)))
}

/// Rewrites the MapLN of every database whose root moved.
fn flush_map_records(env: &EnvironmentImpl, dbs: &[DbRef]) -> Result<u64, Error> {
    let mut written = 0;
    for db in dbs {
        if db.is_deleted() {
            continue;
        }
        let Some(stored) = env.map_record(db.id)? else {
            continue;
        };
        if stored == db.map_record() {
            continue;
        }
        env.write_map_record(db)?;
        written += 1;
    }
    Ok(written)
}
