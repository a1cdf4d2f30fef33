#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::tree::latch::latches_held;
    use crate::tree::tests::helpers::*;
    use crate::tree::{Scope, Seek};

    #[test]
    fn empty_tree_has_no_records() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 8);

        assert!(tree.get(Scope::Main, b"a").unwrap().is_none());
        assert!(tree.seek(Scope::Main, Seek::First).unwrap().is_none());
        assert!(tree.seek(Scope::Main, Seek::Last).unwrap().is_none());
        assert_eq!(tree.count_records().unwrap(), 0);
    }

    #[test]
    fn inserts_split_and_stay_ordered() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 4);

        // Insert in a scrambled order.
        for i in 0..200u32 {
            let k = (i * 37) % 200;
            put(&tree, &key(k), &k.to_le_bytes()).unwrap();
        }

        assert!(tree.with_root(|root| root.level) > 2);
        assert_eq!(tree.count_records().unwrap(), 200);
        for k in 0..200u32 {
            assert_eq!(data_of(&tree, &key(k)), Some(k.to_le_bytes().to_vec()));
        }

        let mut seen = Vec::new();
        let mut cur = tree.seek(Scope::Main, Seek::First).unwrap();
        while let Some(view) = cur {
            seen.push(view.key.clone());
            cur = tree.seek(Scope::Main, Seek::Gt(&view.key)).unwrap();
        }
        let expected: Vec<_> = (0..200u32).map(key).collect();
        assert_eq!(seen, expected);

        let mut back = Vec::new();
        let mut cur = tree.seek(Scope::Main, Seek::Last).unwrap();
        while let Some(view) = cur {
            back.push(view.key.clone());
            cur = tree.seek(Scope::Main, Seek::Lt(&view.key)).unwrap();
        }
        back.reverse();
        assert_eq!(back, expected);
        assert_eq!(latches_held(), 0);
    }

    #[test]
    fn overwrite_keeps_one_slot() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 8);

        put(&tree, b"k", b"1").unwrap();
        put(&tree, b"k", b"2").unwrap();

        assert_eq!(tree.count_records().unwrap(), 1);
        assert_eq!(data_of(&tree, b"k"), Some(b"2".to_vec()));
    }

    #[test]
    fn range_seeks_land_on_neighbours() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 4);
        for k in (0..100u32).step_by(10) {
            put(&tree, &key(k), b"v").unwrap();
        }

        let at = |seek: Seek<'_>| tree.seek(Scope::Main, seek).unwrap().map(|v| v.key);
        assert_eq!(at(Seek::Ge(&key(15))), Some(key(20)));
        assert_eq!(at(Seek::Ge(&key(20))), Some(key(20)));
        assert_eq!(at(Seek::Gt(&key(20))), Some(key(30)));
        assert_eq!(at(Seek::Le(&key(15))), Some(key(10)));
        assert_eq!(at(Seek::Lt(&key(10))), Some(key(0)));
        assert_eq!(at(Seek::Lt(&key(0))), None);
        assert_eq!(at(Seek::Gt(&key(90))), None);
        assert_eq!(at(Seek::Ge(&key(91))), None);
    }

    #[test]
    fn removed_slots_disappear() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 4);
        for k in 0..20u32 {
            put(&tree, &key(k), b"v").unwrap();
        }

        for k in (0..20u32).filter(|k| k % 2 == 0) {
            let removed = tree
                .modify(Scope::Main, &key(k), false, |edit| edit.remove())
                .unwrap()
                .unwrap();
            assert!(removed.is_some());
        }

        assert_eq!(tree.count_records().unwrap(), 10);
        assert!(tree.get(Scope::Main, &key(4)).unwrap().is_none());
        assert_eq!(
            tree.seek(Scope::Main, Seek::First).unwrap().map(|v| v.key),
            Some(key(1))
        );
    }

    #[test]
    fn deleted_flag_excludes_record_from_count() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 8);
        put(&tree, b"a", b"1").unwrap();
        put(&tree, b"b", b"2").unwrap();

        tree.modify(Scope::Main, b"a", false, |edit| {
            if let Some(slot) = edit.slot_mut() {
                if let crate::tree::node::Target::Record { deleted, .. } = &mut slot.target {
                    *deleted = true;
                }
            }
        })
        .unwrap();

        assert_eq!(tree.count_records().unwrap(), 1);
        // Deleted slots are still visible to positional seeks.
        let first = tree.seek(Scope::Main, Seek::First).unwrap().unwrap();
        assert!(first.is_deleted());
    }
}
