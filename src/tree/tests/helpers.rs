use std::path::Path;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::cleaner::UtilizationTracker;
use crate::env::Validity;
use crate::log::{LogConfig, LogManager, Lsn};
use crate::tree::arena::NodeCache;
use crate::tree::comparator::KeyComparator;
use crate::tree::node::{Slot, Target};
use crate::tree::{Scope, Tree, TreeConfig, TreeError};

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub fn cache(dir: &Path) -> Arc<NodeCache> {
    let log = LogManager::open(
        dir,
        LogConfig {
            file_max: 1 << 20,
            buffer_size: 4096,
            read_only: false,
        },
        Arc::new(UtilizationTracker::new()),
        Arc::new(Validity::new()),
    )
    .unwrap();
    Arc::new(NodeCache::new(Arc::new(log), 1 << 30))
}

pub fn tree_with(dir: &Path, node_max: usize, cmp: KeyComparator) -> Tree {
    Tree::create(
        3,
        cache(dir),
        TreeConfig {
            cmp,
            dup_cmp: KeyComparator::bytes(),
            node_max,
            dup_node_max: node_max,
        },
    )
}

pub fn tree(dir: &Path, node_max: usize) -> Tree {
    tree_with(dir, node_max, KeyComparator::bytes())
}

/// Inserts or overwrites a record slot of the main tree.
pub fn put(tree: &Tree, key: &[u8], data: &[u8]) -> Result<(), TreeError> {
    tree.modify(Scope::Main, key, true, |edit| match edit.slot_mut() {
        Some(slot) => {
            slot.target = Target::Record {
                ln_id: 1,
                deleted: false,
                data: Some(data.to_vec()),
            };
            Ok(())
        }
        None => edit.insert(Slot::record(key.to_vec(), Lsn::NULL, 1, Some(data.to_vec()))),
    })?
    .unwrap_or(Ok(()))
}

pub fn data_of(tree: &Tree, key: &[u8]) -> Option<Vec<u8>> {
    let view = tree.get(Scope::Main, key).unwrap()?;
    match view.target {
        crate::tree::ViewTarget::Record { data, deleted: false, .. } => data,
        _ => None,
    }
}

pub fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}
