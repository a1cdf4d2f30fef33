#[cfg(test)]
mod tests {
    use std::cmp::Ordering;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::tree::comparator::*;
    use crate::tree::tests::helpers::*;
    use crate::tree::{Scope, Seek, TreeError};

    /// Orders by the first byte only.
    struct FirstByte;

    impl Comparator for FirstByte {
        fn name(&self) -> &str {
            "first-byte"
        }

        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.first().cmp(&b.first())
        }
    }

    struct Panicky;

    impl Comparator for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn compare(&self, _: &[u8], _: &[u8]) -> Ordering {
            panic!("comparator failure")
        }
    }

    #[test]
    fn registry_has_builtin_orders() {
        let registry = ComparatorRegistry::default();
        assert_eq!(
            registry.names(),
            vec![ByteComparator::NAME.to_string(), ReverseByteComparator::NAME.to_string()]
        );
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn byte_order_uses_fast_path() {
        let cmp = KeyComparator::new(Arc::new(ByteComparator));
        assert_eq!(cmp.name(), ByteComparator::NAME);
        assert_eq!(cmp.compare(b"a", b"b").unwrap(), Ordering::Less);
        cmp.validate_distinct().unwrap();
    }

    #[test]
    fn reverse_order_is_a_valid_duplicate_order() {
        let cmp = KeyComparator::new(Arc::new(ReverseByteComparator));
        assert_eq!(cmp.compare(b"a", b"b").unwrap(), Ordering::Greater);
        cmp.validate_distinct().unwrap();
    }

    #[test]
    fn collapsing_order_is_rejected_for_duplicates() {
        let cmp = KeyComparator::new(Arc::new(FirstByte));
        assert!(matches!(cmp.validate_distinct(), Err(TreeError::InvalidComparator(_))));
    }

    #[test]
    fn panicking_comparator_fails_the_call() {
        init_tracing();
        let cmp = KeyComparator::new(Arc::new(Panicky));
        assert!(matches!(cmp.compare(b"a", b"b"), Err(TreeError::InvalidComparator(_))));

        let tmp = TempDir::new().unwrap();
        let tree = tree_with(tmp.path(), 8, cmp);
        // An empty tree needs no comparison; the second insert does.
        put(&tree, b"a", b"1").unwrap();
        assert!(matches!(put(&tree, b"b", b"2"), Err(TreeError::InvalidComparator(_))));
        assert_eq!(crate::tree::latch::latches_held(), 0);
    }

    #[test]
    fn reverse_tree_iterates_descending() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree_with(tmp.path(), 4, KeyComparator::new(Arc::new(ReverseByteComparator)));
        for k in 0..30u32 {
            put(&tree, &key(k), b"v").unwrap();
        }

        let first = tree.seek(Scope::Main, Seek::First).unwrap().unwrap();
        let last = tree.seek(Scope::Main, Seek::Last).unwrap().unwrap();
        assert_eq!(first.key, key(29));
        assert_eq!(last.key, key(0));
    }
}
