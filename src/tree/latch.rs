//! Node latches.
//!
//! A latch is a short-term reader-writer lock on one node, held only while
//! a thread walks or edits that node. Latches are always taken parent
//! first, and a child is latched before its parent is released.
//!
//! Each thread counts the latches it holds so that code which must not
//! block while latched (the background I/O throttle, lock waits) can be
//! checked in tests with [`latches_held`].

use std::{
    cell::Cell,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::{
    RawRwLock, RwLock,
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
};

use super::arena::MemoryBudget;
use super::node::Node;

/// Shared handle to a resident node.
pub(crate) type NodeRef = Arc<RwLock<Node>>;

thread_local! {
    static HELD: Cell<usize> = const { Cell::new(0) };
}

/// Number of tree latches held by the calling thread.
pub fn latches_held() -> usize {
    HELD.with(Cell::get)
}

fn acquired() {
    HELD.with(|h| h.set(h.get() + 1));
}

fn released() {
    HELD.with(|h| h.set(h.get().saturating_sub(1)));
}

/// Shared latch on a node.
pub(crate) struct SharedLatch {
    guard: ArcRwLockReadGuard<RawRwLock, Node>,
}

impl SharedLatch {
    pub fn acquire(node: &NodeRef) -> Self {
        let guard = node.read_arc();
        acquired();
        Self { guard }
    }
}

impl Deref for SharedLatch {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

impl Drop for SharedLatch {
    fn drop(&mut self) {
        released();
    }
}

/// Exclusive latch on a node. Releasing it re-accounts the node's memory.
pub(crate) struct ExclusiveLatch {
    guard: ArcRwLockWriteGuard<RawRwLock, Node>,
    budget: Arc<MemoryBudget>,
}

impl ExclusiveLatch {
    pub fn acquire(node: &NodeRef, budget: &Arc<MemoryBudget>) -> Self {
        let guard = node.write_arc();
        acquired();
        Self {
            guard,
            budget: Arc::clone(budget),
        }
    }

    pub fn try_acquire(node: &NodeRef, budget: &Arc<MemoryBudget>) -> Option<Self> {
        let guard = node.try_write_arc()?;
        acquired();
        Some(Self {
            guard,
            budget: Arc::clone(budget),
        })
    }
}

impl Deref for ExclusiveLatch {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.guard
    }
}

impl DerefMut for ExclusiveLatch {
    fn deref_mut(&mut self) -> &mut Node {
        &mut self.guard
    }
}

impl Drop for ExclusiveLatch {
    fn drop(&mut self) {
        if !self.guard.detached {
            let size = self.guard.mem_size();
            let old = std::mem::replace(&mut self.guard.accounted, size);
            self.budget.adjust(old, size);
        }
        released();
    }
}

/// Either kind of latch, for descents that mix modes by level.
pub(crate) enum Latch {
    Shared(SharedLatch),
    Exclusive(ExclusiveLatch),
}

impl Latch {
    pub fn acquire(node: &NodeRef, exclusive: bool, budget: &Arc<MemoryBudget>) -> Self {
        if exclusive {
            Latch::Exclusive(ExclusiveLatch::acquire(node, budget))
        } else {
            Latch::Shared(SharedLatch::acquire(node))
        }
    }

    pub fn as_exclusive(&mut self) -> Option<&mut ExclusiveLatch> {
        match self {
            Latch::Exclusive(x) => Some(x),
            Latch::Shared(_) => None,
        }
    }

    pub fn into_exclusive(self) -> Option<ExclusiveLatch> {
        match self {
            Latch::Exclusive(x) => Some(x),
            Latch::Shared(_) => None,
        }
    }
}

impl Deref for Latch {
    type Target = Node;

    fn deref(&self) -> &Node {
        match self {
            Latch::Shared(s) => s,
            Latch::Exclusive(x) => x,
        }
    }
}
