//! Databases of an environment.
//!
//! Three reserved databases hold the environment's own metadata, and they
//! are ordinary trees written through the same record code as user data:
//!
//! | id | name        | key                         | data                |
//! |----|-------------|-----------------------------|---------------------|
//! | 0  | mapping     | database id, 8 bytes BE     | [`MapRecord`]       |
//! | 1  | naming      | database name               | database id, 8 bytes BE |
//! | 2  | utilization | log file number, 4 bytes BE | file summary record |
//!
//! The mapping tree's own root LSN lives in each CkptEnd entry. Every other
//! root, including the naming and utilization roots, is found through its
//! MapLN.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::encoding::{self, Decode, Encode, EncodingError, Reader};
use crate::log::Lsn;
use crate::log::entry::LnKind;
use crate::tree::comparator::{ByteComparator, ComparatorRegistry, KeyComparator};
use crate::tree::{Tree, TreeConfig};
use crate::{DatabaseId, Error};

pub(crate) const MAPPING_DB_ID: DatabaseId = 0;
pub(crate) const NAMING_DB_ID: DatabaseId = 1;
pub(crate) const UTILIZATION_DB_ID: DatabaseId = 2;
pub(crate) const FIRST_USER_DB_ID: DatabaseId = 3;

/// Key of a database in the mapping tree.
pub(crate) fn mapping_key(id: DatabaseId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub(crate) fn id_from_bytes(bytes: &[u8]) -> Option<DatabaseId> {
    Some(DatabaseId::from_be_bytes(bytes.try_into().ok()?))
}

pub(crate) fn is_reserved(id: DatabaseId) -> bool {
    id < FIRST_USER_DB_ID
}

// ------------------------------------------------------------------------------------------------
// MapLN payload
// ------------------------------------------------------------------------------------------------

/// Persistent metadata of one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MapRecord {
    pub root_lsn: Lsn,
    pub sorted_duplicates: bool,
    pub transactional: bool,
    pub btree_comparator: String,
    pub duplicate_comparator: String,
    pub node_max: u32,
    pub dup_node_max: u32,
}

impl MapRecord {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        encoding::encode_to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        encoding::decode_exact(bytes)
    }
}

impl Encode for MapRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.root_lsn.encode_to(buf)?;
        self.sorted_duplicates.encode_to(buf)?;
        self.transactional.encode_to(buf)?;
        self.btree_comparator.encode_to(buf)?;
        self.duplicate_comparator.encode_to(buf)?;
        self.node_max.encode_to(buf)?;
        self.dup_node_max.encode_to(buf)
    }
}

impl Decode for MapRecord {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        Ok(Self {
            root_lsn: reader.read()?,
            sorted_duplicates: reader.read()?,
            transactional: reader.read()?,
            btree_comparator: reader.read()?,
            duplicate_comparator: reader.read()?,
            node_max: reader.read()?,
            dup_node_max: reader.read()?,
        })
    }
}

/// Resolves the comparators a database was created with.
pub(crate) fn tree_config(record: &MapRecord, registry: &ComparatorRegistry) -> Result<TreeConfig, Error> {
    let resolve = |name: &str| -> Result<KeyComparator, Error> {
        if name == ByteComparator::NAME {
            return Ok(KeyComparator::bytes());
        }
        registry
            .get(name)
            .map(KeyComparator::new)
            .ok_or_else(|| Error::InvalidComparator(format!("comparator {name:?} is not registered")))
    };
    Ok(TreeConfig {
        cmp: resolve(&record.btree_comparator)?,
        dup_cmp: resolve(&record.duplicate_comparator)?,
        node_max: record.node_max as usize,
        dup_node_max: record.dup_node_max as usize,
    })
}

// ------------------------------------------------------------------------------------------------
// DatabaseImpl
// ------------------------------------------------------------------------------------------------

/// The shared, in-memory side of one database.
pub(crate) struct DatabaseImpl {
    pub id: DatabaseId,
    pub tree: Tree,
    pub sorted_duplicates: bool,
    pub transactional: bool,
    open_handles: AtomicUsize,
    deleted: AtomicBool,
}

impl DatabaseImpl {
    pub fn new(id: DatabaseId, tree: Tree, sorted_duplicates: bool, transactional: bool) -> Self {
        Self {
            id,
            tree,
            sorted_duplicates,
            transactional,
            open_handles: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    /// MapLN payload describing the database as it is now.
    pub fn map_record(&self) -> MapRecord {
        let config = self.tree.config();
        MapRecord {
            root_lsn: self.tree.root_lsn(),
            sorted_duplicates: self.sorted_duplicates,
            transactional: self.transactional,
            btree_comparator: config.cmp.name().to_string(),
            duplicate_comparator: config.dup_cmp.name().to_string(),
            node_max: config.node_max as u32,
            dup_node_max: config.dup_node_max as u32,
        }
    }

    /// Entry kind of the records stored in this database.
    pub fn ln_kind(&self) -> LnKind {
        match self.id {
            MAPPING_DB_ID => LnKind::Map,
            NAMING_DB_ID => LnKind::Name,
            UTILIZATION_DB_ID => LnKind::FileSummary,
            _ => LnKind::Data,
        }
    }

    pub fn handle_opened(&self) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
    }

    pub fn handle_closed(&self) {
        self.open_handles.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::Acquire)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for DatabaseImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseImpl")
            .field("id", &self.id)
            .field("sorted_duplicates", &self.sorted_duplicates)
            .field("transactional", &self.transactional)
            .field("open_handles", &self.open_handles())
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}

/// Shared handle to a database.
pub(crate) type DbRef = Arc<DatabaseImpl>;
