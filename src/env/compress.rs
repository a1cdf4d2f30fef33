//! Removal of deleted slots.
//!
//! Deletes leave their slot in place, marked deleted, so that an abort can
//! restore it. Every delete (and every undo that leaves a slot deleted)
//! queues the key here. A run removes each queued slot whose record lock is
//! free, prunes bottom nodes left empty and removes duplicate subtrees whose
//! count dropped to zero. Items whose lock is still held go back on the
//! queue for the next run.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cleaner::Obsolete;
use crate::tree::latch::ExclusiveLatch;
use crate::tree::{NodeSpec, Scope, SlotView, ViewTarget};
use crate::txn::lock::{LockGrant, LockId, LockType};
use crate::{DatabaseId, Error};

use super::EnvironmentImpl;
use super::dbtree::DbRef;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Item {
    db: DatabaseId,
    key: Vec<u8>,
    dup: Option<Vec<u8>>,
}

/// Compressor statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressorStats {
    pub runs: u64,
    pub slots_removed: u64,
    pub nodes_pruned: u64,
    pub dup_trees_removed: u64,
    /// Items put back because their record was still locked.
    pub requeued: u64,
    /// Items waiting for the next run.
    pub queued: u64,
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    slots_removed: AtomicU64,
    nodes_pruned: AtomicU64,
    dup_trees_removed: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Default)]
struct Queue {
    order: VecDeque<Item>,
    queued: HashSet<Item>,
}

pub(crate) struct Compressor {
    queue: Mutex<Queue>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    /// Serializes runs.
    run_lock: Mutex<()>,
    counters: Counters,
}

impl Compressor {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            queue: Mutex::new(Queue::default()),
            wake_tx,
            wake_rx,
            run_lock: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Queues a deleted slot; `dup` is the duplicate data inside the
    /// subtree of `key`.
    pub fn enqueue(&self, db: DatabaseId, key: Vec<u8>, dup: Option<Vec<u8>>) {
        let item = Item { db, key, dup };
        let mut queue = self.queue.lock();
        if queue.queued.insert(item.clone()) {
            queue.order.push_back(item);
        }
        drop(queue);
        let _ = self.wake_tx.try_send(());
    }

    /// Channel the compressor daemon waits on.
    pub fn wake_receiver(&self) -> Receiver<()> {
        self.wake_rx.clone()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().order.len()
    }

    fn drain(&self) -> Vec<Item> {
        let mut queue = self.queue.lock();
        queue.queued.clear();
        queue.order.drain(..).collect()
    }

    pub fn stats(&self, clear: bool) -> CompressorStats {
        let load = |c: &AtomicU64| {
            if clear {
                c.swap(0, Ordering::Relaxed)
            } else {
                c.load(Ordering::Relaxed)
            }
        };
        CompressorStats {
            runs: load(&self.counters.runs),
            slots_removed: load(&self.counters.slots_removed),
            nodes_pruned: load(&self.counters.nodes_pruned),
            dup_trees_removed: load(&self.counters.dup_trees_removed),
            requeued: load(&self.counters.requeued),
            queued: self.pending() as u64,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Runs
// ------------------------------------------------------------------------------------------------

/// Processes every queued item once. Returns the number of slots removed.
pub(crate) fn run(env: &EnvironmentImpl) -> Result<u64, Error> {
    let compressor = &env.compressor;
    let _running = compressor.run_lock.lock();
    let items = compressor.drain();
    if items.is_empty() {
        return Ok(0);
    }
    compressor.counters.runs.fetch_add(1, Ordering::Relaxed);
    let before = compressor.counters.slots_removed.load(Ordering::Relaxed);
    let mut busy = Vec::new();
    for item in items {
        let Some(db) = env.registry_get(item.db) else {
            continue;
        };
        if db.is_deleted() {
            continue;
        }
        match compress_item(env, &db, &item) {
            Ok(true) => {}
            Ok(false) => busy.push(item),
            Err(e) => warn!(db = item.db, error = %e, "compressing a deleted slot failed"),
        }
    }
    if !busy.is_empty() {
        compressor
            .counters
            .requeued
            .fetch_add(busy.len() as u64, Ordering::Relaxed);
        for item in busy {
            compressor.enqueue(item.db, item.key, item.dup);
        }
    }
    let removed = compressor.counters.slots_removed.load(Ordering::Relaxed) - before;
    debug!(removed, "compressor run finished");
    Ok(removed)
}

/// Returns false when a record lock kept the item from being finished.
fn compress_item(env: &EnvironmentImpl, db: &DbRef, item: &Item) -> Result<bool, Error> {
    let counters = &env.compressor.counters;
    let locker = env.txns.basic_locker();
    let (scope, slot_key) = match &item.dup {
        Some(dup) => (Scope::Dup(&item.key), dup.as_slice()),
        None => (Scope::Main, item.key.as_slice()),
    };

    if let Some(view) = db.tree.get(scope, slot_key)? {
        if view.is_deleted() {
            let id = LockId::Record(view.ln_id());
            if locker.try_lock(id, LockType::Write)? == LockGrant::Denied {
                return Ok(false);
            }
            let removed = db.tree.modify(scope, slot_key, false, |edit| match edit.view() {
                Some(now) if now.ln_id() == view.ln_id() && now.is_deleted() => {
                    // The deletion was counted obsolete when it committed.
                    edit.remove();
                    Some(edit.leaf_prunable().then(|| edit.leaf_spec()))
                }
                _ => None,
            })?;
            locker.release(id);
            if let Some(Some(prunable)) = removed {
                counters.slots_removed.fetch_add(1, Ordering::Relaxed);
                if let Some(spec) = prunable {
                    prune_empty_node(env, db, &spec)?;
                }
            }
        }
    }

    if item.dup.is_some() {
        return remove_dup_tree(env, db, &item.key);
    }
    Ok(true)
}

fn remove_dup_tree(env: &EnvironmentImpl, db: &DbRef, key: &[u8]) -> Result<bool, Error> {
    let Some(SlotView {
        target: ViewTarget::Dup(count),
        ..
    }) = db.tree.get(Scope::Main, key)?
    else {
        return Ok(true);
    };
    if count.count != 0 {
        return Ok(true);
    }
    let locker = env.txns.basic_locker();
    let id = LockId::Record(count.ln_id);
    if locker.try_lock(id, LockType::Write)? == LockGrant::Denied {
        return Ok(false);
    }
    let removed = db.tree.remove_empty_dup_tree(key, |now| now.ln_id == count.ln_id)?;
    locker.release(id);
    let Some((slot_lsn, root_lsn, count)) = removed else {
        return Ok(true);
    };
    let root = if root_lsn.is_null() { slot_lsn } else { root_lsn };
    if !root.is_null() {
        env.tracker.count_obsolete(&Obsolete::node(root, db.id));
    }
    if !count.lsn.is_null() {
        env.tracker.count_obsolete(&Obsolete::ln(count.lsn, None, db.id));
    }
    env.compressor
        .counters
        .dup_trees_removed
        .fetch_add(1, Ordering::Relaxed);

    let prunable = db.tree.modify(Scope::Main, key, false, |edit| {
        edit.leaf_prunable().then(|| edit.leaf_spec())
    })?;
    if let Some(Some(spec)) = prunable {
        prune_empty_node(env, db, &spec)?;
    }
    Ok(true)
}

/// Detaches an empty, non-root bottom node from its parent.
fn prune_empty_node(env: &EnvironmentImpl, db: &DbRef, spec: &NodeSpec) -> Result<(), Error> {
    let pruned = db.tree.with_parent(spec, |parent| {
        if parent.parent_len() <= 1 {
            return false;
        }
        let Some(child) = parent.resident_child() else {
            return false;
        };
        let budget = Arc::clone(parent.budget());
        let mut child = ExclusiveLatch::acquire(&child, &budget);
        if child.id != spec.id || child.detached || !child.slots.is_empty() {
            return false;
        }
        parent.remove_slot();
        if !child.last_logged.is_null() {
            env.tracker
                .count_obsolete(&Obsolete::node(child.last_logged, db.id));
        }
        env.cache.detach(&mut child);
        true
    })?;
    if pruned == Some(true) {
        env.compressor
            .counters
            .nodes_pruned
            .fetch_add(1, Ordering::Relaxed);
        debug!(db = db.id, node = spec.id, "pruned empty node");
    }
    Ok(())
}
