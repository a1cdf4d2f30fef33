//! Keeping the cache within its budget.
//!
//! Eviction first drops the record data cached in bottom nodes, which
//! costs nothing to get back but a log read. If that is not enough it
//! walks the resident nodes from least recently used and detaches nodes
//! that have no resident children, logging dirty ones first so the parent
//! slot can point at the new version. Roots of main trees stay resident.
//! While a checkpoint runs, dirty nodes are left alone so the checkpoint
//! logs each of them exactly once.

use std::sync::{Arc, atomic::Ordering};

use tracing::debug;

use crate::Error;
use crate::tree::NodeSpec;
use crate::tree::latch::{ExclusiveLatch, SharedLatch};

use super::EnvironmentImpl;

/// What one eviction pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EvictRun {
    pub lns_stripped: u64,
    pub nodes_evicted: u64,
}

pub(crate) fn evict_memory(env: &EnvironmentImpl) -> Result<EvictRun, Error> {
    let cache = &env.cache;
    let budget = cache.budget();
    let mut run = EvictRun::default();
    if !budget.over_budget() {
        return Ok(run);
    }

    for id in cache.lru_order() {
        if !budget.over_budget() {
            break;
        }
        let Some(node) = cache.get(id) else {
            continue;
        };
        let Some(mut node) = ExclusiveLatch::try_acquire(&node, budget) else {
            continue;
        };
        if node.is_bottom() && node.has_cached_data() {
            run.lns_stripped += node.strip_data() as u64;
        }
    }
    cache
        .stats()
        .lns_stripped
        .fetch_add(run.lns_stripped, Ordering::Relaxed);

    let checkpointing = env.checkpointer.in_progress();
    for id in cache.lru_order() {
        if !budget.over_budget() {
            break;
        }
        let Some(node) = cache.get(id) else {
            continue;
        };
        let spec = {
            let node = SharedLatch::acquire(&node);
            let main_root = node.root && node.dup_key.is_none();
            if main_root || node.detached || node.has_resident_children() || (node.dirty && checkpointing) {
                continue;
            }
            NodeSpec::of(&node)
        };
        let Some(db) = env.registry_get(spec.db_id) else {
            continue;
        };
        let evicted = db.tree.with_parent(&spec, |parent| -> Result<bool, Error> {
            if parent.slot().child_id() != Some(spec.id) {
                return Ok(false);
            }
            let Some(child) = parent.resident_child() else {
                return Ok(false);
            };
            let budget = Arc::clone(parent.budget());
            let Some(mut child) = ExclusiveLatch::try_acquire(&child, &budget) else {
                return Ok(false);
            };
            if child.detached || child.has_resident_children() || (child.dirty && checkpointing) {
                return Ok(false);
            }
            if child.dirty {
                let lsn = env.log_node(&mut child, false)?;
                parent.set_child_lsn(lsn);
            }
            parent.clear_child();
            env.cache.detach(&mut child);
            Ok(true)
        })?;
        if evicted.transpose()?.unwrap_or(false) {
            run.nodes_evicted += 1;
        }
    }
    cache
        .stats()
        .nodes_evicted
        .fetch_add(run.nodes_evicted, Ordering::Relaxed);
    if run.nodes_evicted > 0 || run.lns_stripped > 0 {
        debug!(
            stripped = run.lns_stripped,
            evicted = run.nodes_evicted,
            used = budget.used(),
            limit = budget.limit(),
            "evicted"
        );
    }
    Ok(run)
}
