//! Key and duplicate-data comparators.
//!
//! Comparators are registered by name in the environment configuration and
//! a database stores the names it was created with. A comparator that
//! panics fails only the operation that called it.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use super::TreeError;

/// Orders keys (or duplicate data items) of a database.
pub trait Comparator: Send + Sync {
    /// Stable name stored with the database.
    fn name(&self) -> &str;

    /// Compares two byte strings.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Unsigned lexicographic byte order; the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteComparator;

impl ByteComparator {
    pub const NAME: &'static str = "bytes";
}

impl Comparator for ByteComparator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Reverse unsigned lexicographic byte order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseByteComparator;

impl ReverseByteComparator {
    pub const NAME: &'static str = "reverse-bytes";
}

impl Comparator for ReverseByteComparator {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

// ------------------------------------------------------------------------------------------------
// Registry
// ------------------------------------------------------------------------------------------------

/// Named comparators available to databases of an environment.
#[derive(Clone)]
pub struct ComparatorRegistry {
    by_name: BTreeMap<String, Arc<dyn Comparator>>,
}

impl Default for ComparatorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            by_name: BTreeMap::new(),
        };
        registry.register(Arc::new(ByteComparator));
        registry.register(Arc::new(ReverseByteComparator));
        registry
    }
}

impl fmt::Debug for ComparatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.by_name.keys()).finish()
    }
}

impl ComparatorRegistry {
    /// Adds (or replaces) a comparator under its own name.
    pub fn register(&mut self, comparator: Arc<dyn Comparator>) {
        self.by_name
            .insert(comparator.name().to_string(), comparator);
    }

    /// Looks a comparator up by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Comparator>> {
        self.by_name.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Tree-side wrapper
// ------------------------------------------------------------------------------------------------

/// Comparator as used by the tree; byte order takes a fast path and user
/// comparator panics become [`TreeError::InvalidComparator`].
#[derive(Clone)]
pub(crate) struct KeyComparator {
    inner: Option<Arc<dyn Comparator>>,
}

impl fmt::Debug for KeyComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyComparator({})", self.name())
    }
}

impl KeyComparator {
    pub fn bytes() -> Self {
        Self { inner: None }
    }

    pub fn new(comparator: Arc<dyn Comparator>) -> Self {
        if comparator.name() == ByteComparator::NAME {
            return Self::bytes();
        }
        Self {
            inner: Some(comparator),
        }
    }

    pub fn name(&self) -> &str {
        self.inner
            .as_ref()
            .map_or(ByteComparator::NAME, |c| c.name())
    }

    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering, TreeError> {
        let Some(cmp) = &self.inner else {
            return Ok(a.cmp(b));
        };
        panic::catch_unwind(AssertUnwindSafe(|| cmp.compare(a, b)))
            .map_err(|_| TreeError::InvalidComparator(format!("comparator {} panicked", cmp.name())))
    }

    pub fn equal(&self, a: &[u8], b: &[u8]) -> Result<bool, TreeError> {
        Ok(self.compare(a, b)? == Ordering::Equal)
    }

    /// Checks that the comparator is a total order that keeps every pair of
    /// distinct probe values apart. Databases with duplicates rely on this:
    /// two data items that compare equal would be the same duplicate.
    pub fn validate_distinct(&self) -> Result<(), TreeError> {
        if self.inner.is_none() {
            return Ok(());
        }
        let probes = probe_set();
        for (i, a) in probes.iter().enumerate() {
            if self.compare(a, a)? != Ordering::Equal {
                return Err(TreeError::InvalidComparator(format!(
                    "comparator {} is not reflexive for {a:?}",
                    self.name()
                )));
            }
            for b in &probes[i + 1..] {
                let ab = self.compare(a, b)?;
                if ab == Ordering::Equal {
                    return Err(TreeError::InvalidComparator(format!(
                        "comparator {} treats distinct values {a:?} and {b:?} as equal",
                        self.name()
                    )));
                }
                if self.compare(b, a)? != ab.reverse() {
                    return Err(TreeError::InvalidComparator(format!(
                        "comparator {} is not antisymmetric for {a:?} and {b:?}",
                        self.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

fn probe_set() -> Vec<Vec<u8>> {
    let mut probes: Vec<Vec<u8>> = vec![
        vec![],
        vec![0],
        vec![1],
        vec![0x7f],
        vec![0x80],
        vec![0xff],
        vec![0, 0],
        vec![0, 1],
        vec![1, 0],
        vec![0xff, 0xff],
        b"a".to_vec(),
        b"ab".to_vec(),
        b"abc".to_vec(),
        b"b".to_vec(),
        b"ba".to_vec(),
    ];
    for n in [0u32, 1, 2, 255, 256, 65_536, u32::MAX] {
        probes.push(n.to_be_bytes().to_vec());
    }
    for n in [1u64, 1 << 40] {
        probes.push(n.to_be_bytes().to_vec());
    }
    probes.sort();
    probes.dedup();
    probes
}
