#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::log::Lsn;
    use crate::tree::node::{DupCount, Slot};
    use crate::tree::tests::helpers::*;
    use crate::tree::{Scope, Seek, ViewTarget};

    fn dup_tree(tree: &crate::tree::Tree, main: &[u8], items: &[&str]) {
        let items: Vec<&[u8]> = items.iter().map(|s| s.as_bytes()).collect();
        let count = DupCount {
            ln_id: 99,
            lsn: Lsn::NULL,
            count: 1,
        };
        tree.modify(Scope::Main, main, true, |edit| {
            edit.insert_dup_tree(
                main.to_vec(),
                count,
                Slot::record(items[0].to_vec(), Lsn::NULL, 1, Some(items[0].to_vec())),
            )
        })
        .unwrap()
        .unwrap()
        .unwrap();
        for item in items.iter().skip(1) {
            tree.modify(Scope::Dup(main), item, true, |edit| {
                edit.insert(Slot::record(item.to_vec(), Lsn::NULL, 1, Some(item.to_vec())))?;
                if let Some(count) = edit.dup_count() {
                    count.count += 1;
                }
                Ok::<_, crate::tree::TreeError>(())
            })
            .unwrap()
            .unwrap()
            .unwrap();
        }
    }

    #[test]
    fn duplicates_are_ordered_within_their_key() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 4);
        put(&tree, b"a", b"single").unwrap();
        dup_tree(&tree, b"k", &["m", "c", "x", "a", "q", "f"]);

        let view = tree.get(Scope::Main, b"k").unwrap().unwrap();
        assert!(view.is_dup_tree());
        assert!(matches!(view.target, ViewTarget::Dup(DupCount { count: 6, .. })));

        let mut items = Vec::new();
        let mut cur = tree.seek(Scope::Dup(b"k"), Seek::First).unwrap();
        while let Some(v) = cur {
            items.push(v.key.clone());
            cur = tree.seek(Scope::Dup(b"k"), Seek::Gt(&v.key)).unwrap();
        }
        assert_eq!(items, [b"a", b"c", b"f", b"m", b"q", b"x"].map(|s| s.to_vec()));

        assert_eq!(tree.count_records().unwrap(), 7);
    }

    #[test]
    fn dup_scope_without_subtree_is_missing() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 4);
        put(&tree, b"plain", b"v").unwrap();

        assert!(tree.seek(Scope::Dup(b"plain"), Seek::First).unwrap().is_none());
        assert!(tree.modify(Scope::Dup(b"nope"), b"x", true, |_| ()).unwrap().is_none());
    }

    #[test]
    fn empty_dup_tree_is_removed() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 8);
        dup_tree(&tree, b"k", &["1", "2"]);

        for item in [b"1", b"2"] {
            tree.modify(Scope::Dup(b"k"), item, false, |edit| {
                edit.remove();
                if let Some(count) = edit.dup_count() {
                    count.count -= 1;
                }
            })
            .unwrap()
            .unwrap();
        }

        let removed = tree.remove_empty_dup_tree(b"k", |_| true).unwrap();
        let (_, _, count) = removed.unwrap();
        assert_eq!(count.count, 0);
        assert!(tree.get(Scope::Main, b"k").unwrap().is_none());
    }

    #[test]
    fn non_empty_dup_tree_is_kept() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let tree = tree(tmp.path(), 8);
        dup_tree(&tree, b"k", &["1"]);

        assert!(tree.remove_empty_dup_tree(b"k", |_| true).unwrap().is_none());
        assert!(tree.get(Scope::Main, b"k").unwrap().is_some());
    }
}
