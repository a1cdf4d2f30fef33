//! B-tree of one database, with per-key duplicate subtrees.
//!
//! ## Shape
//!
//! Upper nodes (IN, or DIN inside a duplicate subtree) hold child slots;
//! bottom nodes (BIN, DBIN) hold record slots. Slot 0 of an upper node
//! covers every key below slot 1. In a database with sorted duplicates a
//! BIN slot is either a single record or a duplicate subtree whose DBIN
//! slots are keyed by the data items themselves; the subtree's live count
//! is kept in the BIN slot and logged as a DupCountLN.
//!
//! Roots never change identity: a full root splits by pushing its slots
//! down into two new children. Node and record ids come from one counter.
//!
//! ## Latching
//!
//! Descents couple latches: a child is latched before its parent is
//! released. Reads use shared latches. Writes use shared latches on upper
//! nodes and an exclusive latch on the bottom node; writes inside a
//! duplicate subtree also keep the owning BIN exclusively latched, because
//! they update its duplicate count. A descent that meets a non-resident
//! child, or an insert that meets a full bottom node, backs out and repeats
//! the walk with exclusive latches, fetching children from the log and
//! splitting full nodes on the way down. Splits only move slots, so they
//! never call the comparator.
//!
//! ## Ordered walks
//!
//! Nodes have no sibling links. While descending, a walk remembers the
//! nearest separator keys on each side of the path; moving to the next or
//! previous bottom node is a fresh descent toward that separator.

#[cfg(test)]
mod tests;

pub(crate) mod arena;
pub mod comparator;
pub(crate) mod latch;
pub(crate) mod node;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::log::{LogError, Lsn};
use crate::{DatabaseId, NodeId};

use arena::NodeCache;
use comparator::KeyComparator;
use latch::{ExclusiveLatch, Latch, NodeRef, SharedLatch};
use node::{DupCount, Node, Slot, Target};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A node could not be fetched from the log.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// A user comparator panicked or is not a valid order.
    #[error("invalid comparator: {0}")]
    InvalidComparator(String),

    /// A tree invariant does not hold.
    #[error("corrupt tree: {0}")]
    Corrupt(String),
}

fn corrupt(msg: impl Into<String>) -> TreeError {
    TreeError::Corrupt(msg.into())
}

// ------------------------------------------------------------------------------------------------
// Public-facing value types
// ------------------------------------------------------------------------------------------------

/// Per-database tree figures, returned by `Database::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BtreeStats {
    pub internal_nodes: u64,
    pub bottom_nodes: u64,
    pub dup_internal_nodes: u64,
    pub dup_bottom_nodes: u64,
    /// Live record slots; a duplicate subtree contributes its records.
    pub records: u64,
    /// Deleted slots the compressor has not removed yet.
    pub deleted_slots: u64,
    pub dup_trees: u64,
    /// Levels of the main tree, bottom nodes included.
    pub main_height: u32,
    /// Levels of the tallest duplicate subtree.
    pub dup_height: u32,
}

/// Which tree an operation addresses: the main tree, or the duplicate
/// subtree of one main key.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Scope<'k> {
    Main,
    Dup(&'k [u8]),
}

/// Positioning request for [`Tree::seek`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum Seek<'k> {
    First,
    Last,
    Ge(&'k [u8]),
    Gt(&'k [u8]),
    Le(&'k [u8]),
    Lt(&'k [u8]),
}

impl Seek<'_> {
    fn forward(&self) -> bool {
        matches!(self, Seek::First | Seek::Ge(_) | Seek::Gt(_))
    }
}

/// Snapshot of a record slot, taken under a latch and returned after the
/// latch is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SlotView {
    pub key: Vec<u8>,
    pub lsn: Lsn,
    pub target: ViewTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ViewTarget {
    Record {
        ln_id: u64,
        deleted: bool,
        data: Option<Vec<u8>>,
    },
    Dup(DupCount),
}

impl SlotView {
    fn from_slot(slot: &Slot) -> Option<Self> {
        let target = match &slot.target {
            Target::Record {
                ln_id,
                deleted,
                data,
            } => ViewTarget::Record {
                ln_id: *ln_id,
                deleted: *deleted,
                data: data.clone(),
            },
            Target::DupTree { count, .. } => ViewTarget::Dup(*count),
            Target::Child(_) => return None,
        };
        Some(Self {
            key: slot.key.clone(),
            lsn: slot.lsn,
            target,
        })
    }

    /// Record id (the DupCountLN id for a duplicate subtree).
    pub fn ln_id(&self) -> u64 {
        match &self.target {
            ViewTarget::Record { ln_id, .. } => *ln_id,
            ViewTarget::Dup(count) => count.ln_id,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.target, ViewTarget::Record { deleted: true, .. })
    }

    pub fn is_dup_tree(&self) -> bool {
        matches!(self.target, ViewTarget::Dup(_))
    }
}

/// Identifies a node by the path that leads to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeSpec {
    pub id: NodeId,
    pub db_id: DatabaseId,
    pub level: u16,
    pub root: bool,
    pub id_key: Vec<u8>,
    pub dup_key: Option<Vec<u8>>,
}

impl NodeSpec {
    pub fn of(node: &Node) -> Self {
        Self {
            id: node.id,
            db_id: node.db_id,
            level: node.level,
            root: node.root,
            id_key: node.id_key.clone(),
            dup_key: node.dup_key.clone(),
        }
    }

    pub fn from_image(image: &crate::log::entry::NodeImage) -> Self {
        Self {
            id: image.node_id,
            db_id: image.db_id,
            level: image.level,
            root: image.root,
            id_key: image.id_key.clone(),
            dup_key: image.dup_key.clone(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Edit handles
// ------------------------------------------------------------------------------------------------

/// Exclusive access to the bottom node slot for one key, handed to the
/// closure of [`Tree::modify`].
pub(crate) struct LeafEdit<'a> {
    leaf: &'a mut Node,
    pos: Result<usize, usize>,
    can_insert: bool,
    main: Option<(&'a mut Node, usize)>,
    cache: &'a NodeCache,
}

impl LeafEdit<'_> {
    pub fn db_id(&self) -> DatabaseId {
        self.leaf.db_id
    }

    pub fn slot(&self) -> Option<&Slot> {
        self.pos.ok().map(|i| &self.leaf.slots[i])
    }

    pub fn view(&self) -> Option<SlotView> {
        self.slot().and_then(SlotView::from_slot)
    }

    /// Mutable slot; the node becomes dirty.
    pub fn slot_mut(&mut self) -> Option<&mut Slot> {
        let i = self.pos.ok()?;
        self.leaf.dirty = true;
        Some(&mut self.leaf.slots[i])
    }

    /// Inserts a new slot where the key was not found.
    pub fn insert(&mut self, slot: Slot) -> Result<(), TreeError> {
        match self.pos {
            Err(i) if self.can_insert => {
                self.leaf.slots.insert(i, slot);
                self.leaf.dirty = true;
                self.pos = Ok(i);
                Ok(())
            }
            Ok(_) => Err(corrupt("insert over an existing slot")),
            Err(_) => Err(corrupt("insert without reserved room")),
        }
    }

    /// Removes the found slot.
    pub fn remove(&mut self) -> Option<Slot> {
        let i = self.pos.ok()?;
        self.leaf.dirty = true;
        self.pos = Err(i);
        Some(self.leaf.slots.remove(i))
    }

    /// Count slot of the duplicate subtree being edited.
    pub fn dup_count(&mut self) -> Option<&mut DupCount> {
        let (bin, i) = self.main.as_mut()?;
        bin.dirty = true;
        match &mut bin.slots[*i].target {
            Target::DupTree { count, .. } => Some(count),
            _ => None,
        }
    }

    /// True when the bottom node holds no slots and is not a root.
    pub fn leaf_prunable(&self) -> bool {
        self.leaf.slots.is_empty() && !self.leaf.root
    }

    /// True when the edited duplicate subtree is a lone empty root.
    pub fn dup_tree_empty(&self) -> bool {
        self.main.is_some() && self.leaf.root && self.leaf.slots.is_empty()
    }

    pub fn leaf_spec(&self) -> NodeSpec {
        NodeSpec::of(self.leaf)
    }

    /// Inserts a new main slot for `key` holding a duplicate subtree whose
    /// root bottom node contains `first`.
    pub fn insert_dup_tree(&mut self, key: Vec<u8>, count: DupCount, first: Slot) -> Result<(), TreeError> {
        if self.main.is_some() {
            return Err(corrupt("duplicate subtree inside a duplicate subtree"));
        }
        let db_id = self.leaf.db_id;
        let root_id = self.cache.alloc_id();
        let mut root = Node::new(root_id, db_id, 1, Some(key.clone()), first.key.clone());
        root.root = true;
        root.slots.push(first);
        self.insert(Slot {
            key,
            lsn: Lsn::NULL,
            target: Target::DupTree {
                root: Some(root_id),
                count,
            },
        })?;
        self.cache.insert(root);
        debug!(db = db_id, dup_root = root_id, "created duplicate subtree");
        Ok(())
    }
}

/// Exclusive access to the parent slot of a node, handed to the closure of
/// [`Tree::with_parent`].
pub(crate) struct ParentEdit<'a> {
    parent: &'a mut Node,
    idx: usize,
    tree: &'a Tree,
}

impl ParentEdit<'_> {
    pub fn slot(&self) -> &Slot {
        &self.parent.slots[self.idx]
    }

    pub fn parent_len(&self) -> usize {
        self.parent.slots.len()
    }

    /// The resident child, if any.
    pub fn resident_child(&self) -> Option<NodeRef> {
        self.slot()
            .child_id()
            .and_then(|id| self.tree.cache.get(id))
    }

    /// The child, fetched from the log if needed.
    pub fn load_child(&mut self) -> Result<NodeRef, TreeError> {
        self.tree.install_child(self.parent, self.idx)
    }

    /// Records a new LSN for the child and dirties the parent.
    pub fn set_child_lsn(&mut self, lsn: Lsn) {
        self.parent.slots[self.idx].lsn = lsn;
        self.parent.dirty = true;
    }

    /// Marks the child non-resident.
    pub fn clear_child(&mut self) {
        self.parent.slots[self.idx].set_child(None);
    }

    /// Removes the child slot altogether.
    pub fn remove_slot(&mut self) -> Slot {
        self.parent.dirty = true;
        self.parent.slots.remove(self.idx)
    }

    pub fn budget(&self) -> &Arc<arena::MemoryBudget> {
        self.tree.cache.budget()
    }

    /// Describes the parent itself, so a bottom-up walk can continue with it.
    pub fn parent_spec(&self) -> NodeSpec {
        NodeSpec::of(self.parent)
    }

    pub fn parent_dirty(&self) -> bool {
        self.parent.dirty
    }
}

// ------------------------------------------------------------------------------------------------
// Tree
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
struct Bounds {
    upper: Option<Vec<u8>>,
    lower: Option<Vec<u8>>,
}

#[derive(Clone, Copy)]
enum Probe<'k> {
    First,
    Last,
    Le(&'k [u8]),
    Lt(&'k [u8]),
}

struct LeafAccess {
    leaf: Latch,
    main: Option<(Latch, usize)>,
    bounds: Bounds,
}

enum Access {
    Leaf(LeafAccess),
    NeedFetch,
    Missing,
}

/// Sizing and ordering of one tree.
#[derive(Debug, Clone)]
pub(crate) struct TreeConfig {
    pub cmp: KeyComparator,
    pub dup_cmp: KeyComparator,
    pub node_max: usize,
    pub dup_node_max: usize,
}

/// The B-tree of one database.
pub(crate) struct Tree {
    db_id: DatabaseId,
    cache: Arc<NodeCache>,
    root: NodeRef,
    root_id: NodeId,
    config: TreeConfig,
}

impl Tree {
    /// Creates an empty tree with a fresh root.
    pub fn create(db_id: DatabaseId, cache: Arc<NodeCache>, config: TreeConfig) -> Self {
        let root_id = cache.alloc_id();
        let mut root = Node::new(root_id, db_id, 1, None, Vec::new());
        root.root = true;
        let root = cache.insert(root);
        debug!(db = db_id, root = root_id, "created tree");
        Self {
            db_id,
            cache,
            root,
            root_id,
            config,
        }
    }

    /// Opens a tree from its logged root, or creates it when `root_lsn` is
    /// null.
    pub fn open(
        db_id: DatabaseId,
        cache: Arc<NodeCache>,
        config: TreeConfig,
        root_lsn: Lsn,
    ) -> Result<Self, TreeError> {
        if root_lsn.is_null() {
            return Ok(Self::create(db_id, cache, config));
        }
        let mut root = cache.fetch(root_lsn)?;
        if root.db_id != db_id {
            return Err(corrupt(format!(
                "root at {root_lsn} belongs to database {}, not {db_id}",
                root.db_id
            )));
        }
        root.root = true;
        let root_id = root.id;
        let root = match cache.get(root_id) {
            Some(resident) => resident,
            None => cache.insert(root),
        };
        debug!(db = db_id, root = root_id, lsn = %root_lsn, "opened tree");
        Ok(Self {
            db_id,
            cache,
            root,
            root_id,
            config,
        })
    }

    pub fn db_id(&self) -> DatabaseId {
        self.db_id
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn root_ref(&self) -> &NodeRef {
        &self.root
    }

    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// LSN of the last logged version of the root.
    pub fn root_lsn(&self) -> Lsn {
        SharedLatch::acquire(&self.root).last_logged
    }

    fn cmp_for(&self, scope: Scope<'_>) -> &KeyComparator {
        match scope {
            Scope::Main => &self.config.cmp,
            Scope::Dup(_) => &self.config.dup_cmp,
        }
    }

    fn max_for(&self, scope: Scope<'_>) -> usize {
        match scope {
            Scope::Main => self.config.node_max,
            Scope::Dup(_) => self.config.dup_node_max,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Exact lookup of `key` in the given scope.
    pub fn get(&self, scope: Scope<'_>, key: &[u8]) -> Result<Option<SlotView>, TreeError> {
        let probe = Probe::Le(key);
        loop {
            match self.access_leaf(scope, probe, false)? {
                Access::Missing => return Ok(None),
                Access::NeedFetch => self.fetch_path(scope, probe)?,
                Access::Leaf(access) => {
                    let leaf = &access.leaf;
                    self.cache.touch(leaf.id);
                    return Ok(match leaf.find(key, self.cmp_for(scope))? {
                        Ok(i) => SlotView::from_slot(&leaf.slots[i]),
                        Err(_) => None,
                    });
                }
            }
        }
    }

    /// Positional lookup: the first or last slot satisfying `seek`,
    /// including deleted slots.
    pub fn seek(&self, scope: Scope<'_>, seek: Seek<'_>) -> Result<Option<SlotView>, TreeError> {
        let cmp = self.cmp_for(scope);
        let forward = seek.forward();
        let mut bound: Option<Vec<u8>> = None;
        loop {
            let probe = match (&bound, seek) {
                (Some(b), _) if forward => Probe::Le(b),
                (Some(b), _) => Probe::Lt(b),
                (None, Seek::First) => Probe::First,
                (None, Seek::Last) => Probe::Last,
                (None, Seek::Ge(k) | Seek::Gt(k) | Seek::Le(k)) => Probe::Le(k),
                (None, Seek::Lt(k)) => Probe::Lt(k),
            };
            let access = match self.access_leaf(scope, probe, false)? {
                Access::Missing => return Ok(None),
                Access::NeedFetch => {
                    self.fetch_path(scope, probe)?;
                    continue;
                }
                Access::Leaf(access) => access,
            };
            let leaf = &access.leaf;
            let len = leaf.slots.len();
            let idx = match seek {
                Seek::First => (len > 0).then_some(0),
                Seek::Last => len.checked_sub(1),
                Seek::Ge(k) => Some(match leaf.find(k, cmp)? {
                    Ok(i) | Err(i) => i,
                })
                .filter(|&i| i < len),
                Seek::Gt(k) => Some(match leaf.find(k, cmp)? {
                    Ok(i) => i + 1,
                    Err(i) => i,
                })
                .filter(|&i| i < len),
                Seek::Le(k) => match leaf.find(k, cmp)? {
                    Ok(i) => Some(i),
                    Err(i) => i.checked_sub(1),
                },
                Seek::Lt(k) => match leaf.find(k, cmp)? {
                    Ok(i) | Err(i) => i.checked_sub(1),
                },
            };
            if let Some(i) = idx {
                self.cache.touch(leaf.id);
                return Ok(SlotView::from_slot(&leaf.slots[i]));
            }
            let next = if forward {
                access.bounds.upper
            } else {
                access.bounds.lower
            };
            match next {
                Some(b) => {
                    trace!(db = self.db_id, forward, "seek moving to neighbour node");
                    bound = Some(b);
                }
                None => return Ok(None),
            }
        }
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Runs `f` with exclusive access to the slot for `key`. When
    /// `may_insert` is set, room for one new slot is guaranteed. Returns
    /// `None` for a duplicate scope whose main key holds no subtree.
    pub fn modify<R>(
        &self,
        scope: Scope<'_>,
        key: &[u8],
        may_insert: bool,
        f: impl FnOnce(&mut LeafEdit<'_>) -> R,
    ) -> Result<Option<R>, TreeError> {
        let probe = Probe::Le(key);
        let cmp = self.cmp_for(scope);
        let max = self.max_for(scope);
        let (mut access, pos) = loop {
            let access = match self.access_leaf(scope, probe, true)? {
                Access::Missing => return Ok(None),
                Access::NeedFetch => {
                    self.fetch_path(scope, probe)?;
                    continue;
                }
                Access::Leaf(access) => access,
            };
            let pos = access.leaf.find(key, cmp)?;
            if pos.is_err() && may_insert && access.leaf.slots.len() >= max {
                drop(access);
                self.split_path(scope, key)?;
                continue;
            }
            break (access, pos);
        };

        self.cache.touch(access.leaf.id);
        let leaf = &mut **access
            .leaf
            .as_exclusive()
            .ok_or_else(|| corrupt("bottom node not exclusively latched"))?;
        let main = match access.main.as_mut() {
            Some((bin, i)) => Some((
                &mut **bin
                    .as_exclusive()
                    .ok_or_else(|| corrupt("main node not exclusively latched"))?,
                *i,
            )),
            None => None,
        };
        let mut edit = LeafEdit {
            leaf,
            pos,
            can_insert: may_insert,
            main,
            cache: &self.cache,
        };
        Ok(Some(f(&mut edit)))
    }

    /// Runs `f` with the parent of the node described by `spec` exclusively
    /// latched. Returns `None` for a main root or when no parent covering
    /// the node exists any more.
    pub fn with_parent<R>(
        &self,
        spec: &NodeSpec,
        f: impl FnOnce(&mut ParentEdit<'_>) -> R,
    ) -> Result<Option<R>, TreeError> {
        let budget = self.cache.budget();
        let root = ExclusiveLatch::acquire(&self.root, budget);
        let mut parent = match &spec.dup_key {
            None => {
                if spec.root || root.level <= spec.level {
                    return Ok(None);
                }
                let parent = self.walk_exclusive(
                    root,
                    Probe::Le(&spec.id_key),
                    &self.config.cmp,
                    spec.level + 1,
                    None,
                )?;
                if parent.level != spec.level + 1 {
                    return Ok(None);
                }
                parent
            }
            Some(dup_key) => {
                let mut bin = self.walk_exclusive(root, Probe::Le(dup_key), &self.config.cmp, 1, None)?;
                let Ok(i) = bin.find(dup_key, &self.config.cmp)? else {
                    return Ok(None);
                };
                if !matches!(bin.slots[i].target, Target::DupTree { .. }) {
                    return Ok(None);
                }
                if spec.root {
                    let mut edit = ParentEdit {
                        parent: &mut bin,
                        idx: i,
                        tree: self,
                    };
                    return Ok(Some(f(&mut edit)));
                }
                let dup_root = self.install_child(&mut bin, i)?;
                let dup_root = ExclusiveLatch::acquire(&dup_root, budget);
                drop(bin);
                if dup_root.level <= spec.level {
                    return Ok(None);
                }
                let parent = self.walk_exclusive(
                    dup_root,
                    Probe::Le(&spec.id_key),
                    &self.config.dup_cmp,
                    spec.level + 1,
                    None,
                )?;
                if parent.level != spec.level + 1 {
                    return Ok(None);
                }
                parent
            }
        };
        let cmp = if spec.dup_key.is_some() {
            &self.config.dup_cmp
        } else {
            &self.config.cmp
        };
        let idx = parent.child_index(&spec.id_key, cmp, false)?;
        let mut edit = ParentEdit {
            parent: &mut parent,
            idx,
            tree: self,
        };
        Ok(Some(f(&mut edit)))
    }

    /// Runs `f` with the root exclusively latched.
    pub fn with_root<R>(&self, f: impl FnOnce(&mut Node) -> R) -> R {
        let mut root = ExclusiveLatch::acquire(&self.root, self.cache.budget());
        f(&mut root)
    }

    /// Removes the duplicate subtree of `key` when its count is zero, its
    /// root is an empty bottom node and `can_remove` agrees. Returns the
    /// removed slot's LSN, the root's last logged LSN and the count.
    pub fn remove_empty_dup_tree(
        &self,
        key: &[u8],
        can_remove: impl FnOnce(&DupCount) -> bool,
    ) -> Result<Option<(Lsn, Lsn, DupCount)>, TreeError> {
        let budget = self.cache.budget();
        let root = ExclusiveLatch::acquire(&self.root, budget);
        let mut bin = self.walk_exclusive(root, Probe::Le(key), &self.config.cmp, 1, None)?;
        let Ok(i) = bin.find(key, &self.config.cmp)? else {
            return Ok(None);
        };
        let Target::DupTree { count, .. } = bin.slots[i].target else {
            return Ok(None);
        };
        if count.count != 0 {
            return Ok(None);
        }
        let dup_root = self.install_child(&mut bin, i)?;
        let mut dup_root = ExclusiveLatch::acquire(&dup_root, budget);
        if !dup_root.is_bottom() || !dup_root.slots.is_empty() || !can_remove(&count) {
            return Ok(None);
        }
        let slot = bin.slots.remove(i);
        bin.dirty = true;
        let root_lsn = dup_root.last_logged;
        self.cache.detach(&mut dup_root);
        debug!(db = self.db_id, "removed empty duplicate subtree");
        Ok(Some((slot.lsn, root_lsn, count)))
    }

    // --------------------------------------------------------------------------------------------
    // Whole-tree walks
    // --------------------------------------------------------------------------------------------

    /// Number of live records, counting every duplicate.
    pub fn count_records(&self) -> Result<u64, TreeError> {
        let mut count = 0u64;
        let mut cursor = self.seek(Scope::Main, Seek::First)?;
        while let Some(view) = cursor {
            match &view.target {
                ViewTarget::Record { deleted: false, .. } => count += 1,
                ViewTarget::Record { .. } => {}
                ViewTarget::Dup(dup) => count += dup.count,
            }
            cursor = self.seek(Scope::Main, Seek::Gt(&view.key))?;
        }
        Ok(count)
    }

    /// Shape and content figures of the whole tree, duplicate subtrees
    /// included. Non-resident nodes are read from the log and not cached.
    pub fn stats(&self) -> Result<BtreeStats, TreeError> {
        let (level, slots) = {
            let root = SharedLatch::acquire(&self.root);
            (root.level, root.slots.clone())
        };
        let mut stats = BtreeStats {
            main_height: u32::from(level),
            ..BtreeStats::default()
        };
        self.walk_stats(level, false, slots, &mut stats)?;
        Ok(stats)
    }

    fn walk_stats(
        &self,
        level: u16,
        dup: bool,
        slots: Vec<Slot>,
        stats: &mut BtreeStats,
    ) -> Result<(), TreeError> {
        match (dup, level <= 1) {
            (false, false) => stats.internal_nodes += 1,
            (false, true) => stats.bottom_nodes += 1,
            (true, false) => stats.dup_internal_nodes += 1,
            (true, true) => stats.dup_bottom_nodes += 1,
        }
        for slot in slots {
            let child = match &slot.target {
                Target::Record { deleted: true, .. } => {
                    stats.deleted_slots += 1;
                    continue;
                }
                Target::Record { .. } => {
                    stats.records += 1;
                    continue;
                }
                Target::DupTree { root, .. } => {
                    stats.dup_trees += 1;
                    *root
                }
                Target::Child(child) => *child,
            };
            let subtree = matches!(slot.target, Target::DupTree { .. });
            let fetched = match child.and_then(|id| self.cache.get(id)) {
                Some(node) => {
                    let node = SharedLatch::acquire(&node);
                    Some((node.level, node.slots.clone()))
                }
                None if !slot.lsn.is_null() => {
                    let node = self.cache.fetch(slot.lsn)?;
                    Some((node.level, node.slots))
                }
                None => None,
            };
            if let Some((level, slots)) = fetched {
                if subtree {
                    stats.dup_height = stats.dup_height.max(u32::from(level));
                }
                self.walk_stats(level, dup || subtree, slots, stats)?;
            }
        }
        Ok(())
    }

    /// Visits the LSN of every logged node and live record of the tree,
    /// reading non-resident nodes from the log without caching them.
    /// `f` receives the LSN and whether it belongs to a node.
    pub fn visit_lsns(&self, f: &mut dyn FnMut(Lsn, bool)) -> Result<(), TreeError> {
        let (root_lsn, slots) = {
            let root = SharedLatch::acquire(&self.root);
            (root.last_logged, root.slots.clone())
        };
        if !root_lsn.is_null() {
            f(root_lsn, true);
        }
        self.visit_slots(slots, f)
    }

    fn visit_slots(&self, slots: Vec<Slot>, f: &mut dyn FnMut(Lsn, bool)) -> Result<(), TreeError> {
        for slot in slots {
            match &slot.target {
                Target::Record { deleted, .. } => {
                    if !*deleted && !slot.lsn.is_null() {
                        f(slot.lsn, false);
                    }
                }
                Target::Child(child) | Target::DupTree { root: child, .. } => {
                    if let Target::DupTree { count, .. } = &slot.target {
                        if !count.lsn.is_null() {
                            f(count.lsn, false);
                        }
                    }
                    if !slot.lsn.is_null() {
                        f(slot.lsn, true);
                    }
                    let resident = child.and_then(|id| self.cache.get(id));
                    let children = match resident {
                        Some(node) => SharedLatch::acquire(&node).slots.clone(),
                        None if !slot.lsn.is_null() => self.cache.fetch(slot.lsn)?.slots,
                        None => Vec::new(),
                    };
                    self.visit_slots(children, f)?;
                }
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Descent machinery
    // --------------------------------------------------------------------------------------------

    /// Latches a subtree root, exclusively if it is a bottom node and the
    /// walk is a write.
    fn latch_top(&self, node: &NodeRef, write: bool) -> Latch {
        let latch = Latch::Shared(SharedLatch::acquire(node));
        if write && latch.level <= 1 {
            drop(latch);
            return Latch::acquire(node, true, self.cache.budget());
        }
        latch
    }

    fn access_leaf(&self, scope: Scope<'_>, probe: Probe<'_>, write: bool) -> Result<Access, TreeError> {
        let mut bounds = Bounds::default();
        let root = self.latch_top(&self.root, write);
        match scope {
            Scope::Main => {
                let Some(leaf) = self.walk_down(root, probe, &self.config.cmp, write, &mut bounds)? else {
                    return Ok(Access::NeedFetch);
                };
                Ok(Access::Leaf(LeafAccess {
                    leaf,
                    main: None,
                    bounds,
                }))
            }
            Scope::Dup(main_key) => {
                let mut main_bounds = Bounds::default();
                let Some(bin) =
                    self.walk_down(root, Probe::Le(main_key), &self.config.cmp, write, &mut main_bounds)?
                else {
                    return Ok(Access::NeedFetch);
                };
                let Ok(i) = bin.find(main_key, &self.config.cmp)? else {
                    return Ok(Access::Missing);
                };
                let Target::DupTree { root: dup_root, .. } = &bin.slots[i].target else {
                    return Ok(Access::Missing);
                };
                let Some(dup_root) = dup_root.and_then(|id| self.cache.get(id)) else {
                    return Ok(Access::NeedFetch);
                };
                let top = self.latch_top(&dup_root, write);
                let main = if write {
                    Some((bin, i))
                } else {
                    drop(bin);
                    None
                };
                let Some(leaf) = self.walk_down(top, probe, &self.config.dup_cmp, write, &mut bounds)? else {
                    return Ok(Access::NeedFetch);
                };
                Ok(Access::Leaf(LeafAccess { leaf, main, bounds }))
            }
        }
    }

    /// Couples down to the bottom node. Returns `None` when a child is not
    /// resident.
    fn walk_down(
        &self,
        mut cur: Latch,
        probe: Probe<'_>,
        cmp: &KeyComparator,
        write: bool,
        bounds: &mut Bounds,
    ) -> Result<Option<Latch>, TreeError> {
        let budget = self.cache.budget();
        loop {
            if cur.level <= 1 {
                return Ok(Some(cur));
            }
            if cur.slots.is_empty() {
                return Err(corrupt(format!("upper node {} has no slots", cur.id)));
            }
            let idx = choose(&cur, probe, cmp)?;
            note_bounds(&cur, idx, bounds);
            let Some(child) = cur.slots[idx].child_id().and_then(|id| self.cache.get(id)) else {
                return Ok(None);
            };
            let exclusive = write && cur.level == 2;
            cur = Latch::acquire(&child, exclusive, budget);
        }
    }

    /// Couples down with exclusive latches to `stop_level`, fetching
    /// children and, when `split_max` is set, splitting full children.
    fn walk_exclusive(
        &self,
        mut cur: ExclusiveLatch,
        probe: Probe<'_>,
        cmp: &KeyComparator,
        stop_level: u16,
        split_max: Option<usize>,
    ) -> Result<ExclusiveLatch, TreeError> {
        let budget = self.cache.budget();
        loop {
            if cur.level <= stop_level {
                return Ok(cur);
            }
            if cur.slots.is_empty() {
                return Err(corrupt(format!("upper node {} has no slots", cur.id)));
            }
            let mut idx = choose(&cur, probe, cmp)?;
            let child_ref = self.install_child(&mut cur, idx)?;
            let mut child = ExclusiveLatch::acquire(&child_ref, budget);
            if let Some(max) = split_max {
                if child.slots.len() >= max {
                    self.split_child(&mut cur, idx, &mut child);
                    idx = choose(&cur, probe, cmp)?;
                    if cur.slots[idx].child_id() != Some(child.id) {
                        let sibling = self.install_child(&mut cur, idx)?;
                        child = ExclusiveLatch::acquire(&sibling, budget);
                    }
                }
            }
            cur = child;
        }
    }

    /// Makes the child of `parent.slots[idx]` resident.
    fn install_child(&self, parent: &mut Node, idx: usize) -> Result<NodeRef, TreeError> {
        let slot = &parent.slots[idx];
        if let Some(resident) = slot.child_id().and_then(|id| self.cache.get(id)) {
            return Ok(resident);
        }
        if slot.lsn.is_null() {
            return Err(corrupt(format!(
                "node {} slot {idx} has neither a resident child nor an LSN",
                parent.id
            )));
        }
        let node = self.cache.fetch(slot.lsn)?;
        let id = node.id;
        let node_ref = self.cache.insert(node);
        parent.slots[idx].set_child(Some(id));
        Ok(node_ref)
    }

    /// Exclusive walk that only fetches.
    fn fetch_path(&self, scope: Scope<'_>, probe: Probe<'_>) -> Result<(), TreeError> {
        let budget = self.cache.budget();
        let root = ExclusiveLatch::acquire(&self.root, budget);
        match scope {
            Scope::Main => {
                self.walk_exclusive(root, probe, &self.config.cmp, 1, None)?;
            }
            Scope::Dup(main_key) => {
                let mut bin = self.walk_exclusive(root, Probe::Le(main_key), &self.config.cmp, 1, None)?;
                let Ok(i) = bin.find(main_key, &self.config.cmp)? else {
                    return Ok(());
                };
                if !matches!(bin.slots[i].target, Target::DupTree { .. }) {
                    return Ok(());
                }
                let dup_root = self.install_child(&mut bin, i)?;
                let dup_root = ExclusiveLatch::acquire(&dup_root, budget);
                drop(bin);
                self.walk_exclusive(dup_root, probe, &self.config.dup_cmp, 1, None)?;
            }
        }
        Ok(())
    }

    /// Exclusive walk toward `key` that splits every full node on the way.
    fn split_path(&self, scope: Scope<'_>, key: &[u8]) -> Result<(), TreeError> {
        let budget = self.cache.budget();
        let mut root = ExclusiveLatch::acquire(&self.root, budget);
        match scope {
            Scope::Main => {
                if root.slots.len() >= self.config.node_max {
                    self.push_down(&mut root);
                }
                self.walk_exclusive(
                    root,
                    Probe::Le(key),
                    &self.config.cmp,
                    1,
                    Some(self.config.node_max),
                )?;
            }
            Scope::Dup(main_key) => {
                let mut bin = self.walk_exclusive(root, Probe::Le(main_key), &self.config.cmp, 1, None)?;
                let Ok(i) = bin.find(main_key, &self.config.cmp)? else {
                    return Ok(());
                };
                if !matches!(bin.slots[i].target, Target::DupTree { .. }) {
                    return Ok(());
                }
                let dup_root = self.install_child(&mut bin, i)?;
                let mut dup_root = ExclusiveLatch::acquire(&dup_root, budget);
                if dup_root.slots.len() >= self.config.dup_node_max {
                    self.push_down(&mut dup_root);
                }
                drop(bin);
                self.walk_exclusive(
                    dup_root,
                    Probe::Le(key),
                    &self.config.dup_cmp,
                    1,
                    Some(self.config.dup_node_max),
                )?;
            }
        }
        Ok(())
    }

    /// Splits `child` (slot `idx` of `parent`) into itself and a new right
    /// sibling.
    fn split_child(&self, parent: &mut Node, idx: usize, child: &mut Node) {
        let sibling_id = self.cache.alloc_id();
        let mut sibling = Node::new(
            sibling_id,
            child.db_id,
            child.level,
            child.dup_key.clone(),
            Vec::new(),
        );
        let separator = child.split_into(&mut sibling);
        parent
            .slots
            .insert(idx + 1, Slot::child(separator, Lsn::NULL, sibling_id));
        parent.dirty = true;
        debug!(
            db = self.db_id,
            node = child.id,
            sibling = sibling_id,
            level = child.level,
            "split node"
        );
        self.cache.insert(sibling);
    }

    /// Splits a full root by moving its slots into two new children; the
    /// root keeps its id and grows one level.
    fn push_down(&self, root: &mut Node) {
        let left_id = self.cache.alloc_id();
        let right_id = self.cache.alloc_id();
        let first_key = root.slots.first().map(|s| s.key.clone()).unwrap_or_default();
        let mut left = Node::new(left_id, root.db_id, root.level, root.dup_key.clone(), first_key.clone());
        let mut right = Node::new(right_id, root.db_id, root.level, root.dup_key.clone(), Vec::new());
        left.slots = std::mem::take(&mut root.slots);
        let separator = left.split_into(&mut right);
        root.slots = vec![
            Slot::child(first_key, Lsn::NULL, left_id),
            Slot::child(separator, Lsn::NULL, right_id),
        ];
        root.level += 1;
        root.dirty = true;
        debug!(
            db = self.db_id,
            root = root.id,
            level = root.level,
            "split root"
        );
        self.cache.insert(left);
        self.cache.insert(right);
    }
}

fn choose(node: &Node, probe: Probe<'_>, cmp: &KeyComparator) -> Result<usize, TreeError> {
    match probe {
        Probe::First => Ok(0),
        Probe::Last => Ok(node.slots.len() - 1),
        Probe::Le(key) => node.child_index(key, cmp, false),
        Probe::Lt(key) => node.child_index(key, cmp, true),
    }
}

fn note_bounds(node: &Node, idx: usize, bounds: &mut Bounds) {
    if let Some(next) = node.slots.get(idx + 1) {
        bounds.upper = Some(next.key.clone());
    }
    if idx > 0 {
        bounds.lower = Some(node.slots[idx].key.clone());
    }
}
