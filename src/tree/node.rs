//! In-memory tree nodes.

use crate::log::Lsn;
use crate::log::entry::{LogEntryType, NodeImage, SlotImage, TargetImage};
use crate::{DatabaseId, NodeId};

use super::TreeError;
use super::comparator::KeyComparator;

const NODE_OVERHEAD: usize = 160;
const SLOT_OVERHEAD: usize = 56;

/// Live record count of a duplicate subtree and the DupCountLN holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DupCount {
    pub ln_id: u64,
    pub lsn: Lsn,
    pub count: u64,
}

/// What a slot points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// A child node; `None` while the child is not resident.
    Child(Option<NodeId>),
    /// A leaf record. `data` caches the record value once read or written.
    Record {
        ln_id: u64,
        deleted: bool,
        data: Option<Vec<u8>>,
    },
    /// A duplicate subtree. The slot LSN is the subtree root's LSN.
    DupTree {
        root: Option<NodeId>,
        count: DupCount,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    pub key: Vec<u8>,
    pub lsn: Lsn,
    pub target: Target,
}

impl Slot {
    pub fn record(key: Vec<u8>, lsn: Lsn, ln_id: u64, data: Option<Vec<u8>>) -> Self {
        Self {
            key,
            lsn,
            target: Target::Record {
                ln_id,
                deleted: false,
                data,
            },
        }
    }

    pub fn child(key: Vec<u8>, lsn: Lsn, id: NodeId) -> Self {
        Self {
            key,
            lsn,
            target: Target::Child(Some(id)),
        }
    }

    /// Record id of a record slot.
    pub fn ln_id(&self) -> Option<u64> {
        match &self.target {
            Target::Record { ln_id, .. } => Some(*ln_id),
            Target::DupTree { count, .. } => Some(count.ln_id),
            Target::Child(_) => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self.target, Target::Record { deleted: true, .. })
    }

    /// Resident child of a node slot or duplicate slot.
    pub fn child_id(&self) -> Option<NodeId> {
        match &self.target {
            Target::Child(id) => *id,
            Target::DupTree { root, .. } => *root,
            Target::Record { .. } => None,
        }
    }

    pub fn set_child(&mut self, id: Option<NodeId>) {
        match &mut self.target {
            Target::Child(child) => *child = id,
            Target::DupTree { root, .. } => *root = id,
            Target::Record { .. } => {}
        }
    }

    fn mem_size(&self) -> usize {
        let data = match &self.target {
            Target::Record { data: Some(d), .. } => d.len(),
            _ => 0,
        };
        SLOT_OVERHEAD + self.key.len() + data
    }
}

/// One node of a main tree or duplicate subtree.
#[derive(Debug)]
pub(crate) struct Node {
    pub id: NodeId,
    pub db_id: DatabaseId,
    /// 1 for bottom nodes (BIN/DBIN).
    pub level: u16,
    pub root: bool,
    pub dup_key: Option<Vec<u8>>,
    /// Key of this node's slot in its parent.
    pub id_key: Vec<u8>,
    pub slots: Vec<Slot>,
    pub dirty: bool,
    pub last_logged: Lsn,
    /// Bytes charged to the memory budget for this node.
    pub accounted: usize,
    /// Set once the node has been removed from the cache.
    pub detached: bool,
}

impl Node {
    pub fn new(
        id: NodeId,
        db_id: DatabaseId,
        level: u16,
        dup_key: Option<Vec<u8>>,
        id_key: Vec<u8>,
    ) -> Self {
        Self {
            id,
            db_id,
            level,
            root: false,
            dup_key,
            id_key,
            slots: Vec::new(),
            dirty: true,
            last_logged: Lsn::NULL,
            accounted: 0,
            detached: false,
        }
    }

    pub fn from_image(image: NodeImage, lsn: Lsn) -> Self {
        let slots = image
            .slots
            .into_iter()
            .map(|s| Slot {
                key: s.key,
                lsn: s.lsn,
                target: match s.target {
                    TargetImage::Child => Target::Child(None),
                    TargetImage::Record { ln_id, deleted } => Target::Record {
                        ln_id,
                        deleted,
                        data: None,
                    },
                    TargetImage::DupTree {
                        count_ln_id,
                        count_lsn,
                        count,
                    } => Target::DupTree {
                        root: None,
                        count: DupCount {
                            ln_id: count_ln_id,
                            lsn: count_lsn,
                            count,
                        },
                    },
                },
            })
            .collect();
        Self {
            id: image.node_id,
            db_id: image.db_id,
            level: image.level,
            root: image.root,
            dup_key: image.dup_key,
            id_key: image.id_key,
            slots,
            dirty: false,
            last_logged: lsn,
            accounted: 0,
            detached: false,
        }
    }

    pub fn to_image(&self) -> NodeImage {
        NodeImage {
            node_id: self.id,
            db_id: self.db_id,
            level: self.level,
            root: self.root,
            dup_key: self.dup_key.clone(),
            id_key: self.id_key.clone(),
            prev_logged: self.last_logged,
            slots: self
                .slots
                .iter()
                .map(|s| SlotImage {
                    key: s.key.clone(),
                    lsn: s.lsn,
                    target: match &s.target {
                        Target::Child(_) => TargetImage::Child,
                        Target::Record { ln_id, deleted, .. } => TargetImage::Record {
                            ln_id: *ln_id,
                            deleted: *deleted,
                        },
                        Target::DupTree { count, .. } => TargetImage::DupTree {
                            count_ln_id: count.ln_id,
                            count_lsn: count.lsn,
                            count: count.count,
                        },
                    },
                })
                .collect(),
        }
    }

    pub fn is_bottom(&self) -> bool {
        self.level <= 1
    }

    pub fn entry_type(&self) -> LogEntryType {
        match (self.is_bottom(), self.dup_key.is_some()) {
            (true, false) => LogEntryType::Bin,
            (true, true) => LogEntryType::Dbin,
            (false, false) => LogEntryType::In,
            (false, true) => LogEntryType::Din,
        }
    }

    pub fn mem_size(&self) -> usize {
        NODE_OVERHEAD + self.id_key.len() + self.slots.iter().map(Slot::mem_size).sum::<usize>()
    }

    /// True if any slot references a resident node.
    pub fn has_resident_children(&self) -> bool {
        self.slots.iter().any(|s| s.child_id().is_some())
    }

    /// Drops cached record data; returns the number of records stripped.
    pub fn strip_data(&mut self) -> usize {
        let mut stripped = 0;
        for slot in &mut self.slots {
            if let Target::Record { data, .. } = &mut slot.target {
                if data.take().is_some() {
                    stripped += 1;
                }
            }
        }
        stripped
    }

    pub fn has_cached_data(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.target, Target::Record { data: Some(_), .. }))
    }

    /// Binary search of a bottom node: `Ok(index)` of the slot equal to
    /// `key`, or `Err(index)` where it would be inserted.
    pub fn find(&self, key: &[u8], cmp: &KeyComparator) -> Result<Result<usize, usize>, TreeError> {
        let (mut lo, mut hi) = (0usize, self.slots.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp.compare(&self.slots[mid].key, key)? {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    /// Index of the child of an upper node that covers `key`: the last slot
    /// whose key is `<= key` (`< key` when `strict`). Slot 0 covers
    /// everything below slot 1.
    pub fn child_index(&self, key: &[u8], cmp: &KeyComparator, strict: bool) -> Result<usize, TreeError> {
        let (mut lo, mut hi) = (1usize, self.slots.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let ord = cmp.compare(&self.slots[mid].key, key)?;
            let go_right = if strict {
                ord == std::cmp::Ordering::Less
            } else {
                ord != std::cmp::Ordering::Greater
            };
            if go_right {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo - 1)
    }

    /// Moves the upper half of the slots into `sibling`, which must be empty.
    /// Returns the separator key for the sibling.
    pub fn split_into(&mut self, sibling: &mut Node) -> Vec<u8> {
        let half = self.slots.len() / 2;
        sibling.slots = self.slots.split_off(half);
        sibling.id_key = sibling.slots[0].key.clone();
        self.dirty = true;
        sibling.dirty = true;
        sibling.id_key.clone()
    }
}
