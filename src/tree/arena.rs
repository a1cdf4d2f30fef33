//! The node cache: an arena of resident nodes indexed by node id.
//!
//! Parents refer to children by id, never by owning pointer, so the
//! ownership graph has no cycles. A child that is not resident is fetched
//! from the log through its parent slot's LSN and installed here. Residency
//! order is tracked in an LRU list for the evictor, and every node's
//! approximate size is charged to a [`MemoryBudget`].

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::log::entry::LogEntry;
use crate::log::{LogManager, Lsn};
use crate::{DatabaseId, NodeId};

use super::TreeError;
use super::latch::NodeRef;
use super::node::Node;

// ------------------------------------------------------------------------------------------------
// Memory budget
// ------------------------------------------------------------------------------------------------

/// Approximate bytes used by resident nodes, against a configurable limit.
#[derive(Debug)]
pub(crate) struct MemoryBudget {
    used: AtomicI64,
    limit: AtomicU64,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            used: AtomicI64::new(0),
            limit: AtomicU64::new(limit),
        }
    }

    pub fn adjust(&self, old: usize, new: usize) {
        self.used
            .fetch_add(new as i64 - old as i64, Ordering::Relaxed);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn over_budget(&self) -> bool {
        self.used() > self.limit()
    }
}

// ------------------------------------------------------------------------------------------------
// Cache
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    pub fetches: AtomicU64,
    pub nodes_evicted: AtomicU64,
    pub lns_stripped: AtomicU64,
}

pub(crate) struct NodeCache {
    nodes: RwLock<HashMap<NodeId, NodeRef>>,
    lru: Mutex<LruCache<NodeId, ()>>,
    budget: Arc<MemoryBudget>,
    next_id: AtomicU64,
    log: Arc<LogManager>,
    stats: CacheStats,
}

impl NodeCache {
    pub fn new(log: Arc<LogManager>, limit: u64) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            lru: Mutex::new(LruCache::unbounded()),
            budget: Arc::new(MemoryBudget::new(limit)),
            next_id: AtomicU64::new(1),
            log,
            stats: CacheStats::default(),
        }
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Allocates a node or record id.
    pub fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Last id handed out.
    pub fn last_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Ensures future ids are greater than `seen`.
    pub fn advance_ids(&self, seen: u64) {
        self.next_id.fetch_max(seen + 1, Ordering::Relaxed);
    }

    /// Makes a node resident and returns its handle.
    pub fn insert(&self, mut node: Node) -> NodeRef {
        node.accounted = node.mem_size();
        self.budget.adjust(0, node.accounted);
        let id = node.id;
        let node_ref = Arc::new(RwLock::new(node));
        self.nodes.write().insert(id, Arc::clone(&node_ref));
        self.lru.lock().put(id, ());
        node_ref
    }

    pub fn get(&self, id: NodeId) -> Option<NodeRef> {
        self.nodes.read().get(&id).cloned()
    }

    /// Marks a node as recently used.
    pub fn touch(&self, id: NodeId) {
        self.lru.lock().get(&id);
    }

    /// Removes a node the caller holds exclusively latched.
    pub fn detach(&self, node: &mut Node) {
        node.detached = true;
        self.budget.adjust(node.accounted, 0);
        node.accounted = 0;
        self.nodes.write().remove(&node.id);
        self.lru.lock().pop(&node.id);
    }

    /// Reads a node image from the log.
    pub fn fetch(&self, lsn: Lsn) -> Result<Node, TreeError> {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        match self.log.read_entry(lsn)? {
            LogEntry::Node(image) => {
                trace!(%lsn, node = image.node_id, "fetched node");
                Ok(Node::from_image(image, lsn))
            }
            other => Err(TreeError::Corrupt(format!(
                "expected a node at {lsn}, found {}",
                other.entry_type().name()
            ))),
        }
    }

    /// Resident node ids from least to most recently used.
    pub fn lru_order(&self) -> Vec<NodeId> {
        self.lru.lock().iter().rev().map(|(id, _)| *id).collect()
    }

    /// All resident nodes.
    pub fn resident(&self) -> Vec<NodeRef> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn resident_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Drops every resident node of a database. Used once the database is
    /// deleted and unreachable.
    pub fn purge_db(&self, db_id: DatabaseId) {
        // Latches are never waited on while the map lock is held.
        for node in self.resident() {
            let mut guard = node.write();
            if guard.db_id == db_id && !guard.detached {
                self.detach(&mut guard);
            }
        }
    }
}
