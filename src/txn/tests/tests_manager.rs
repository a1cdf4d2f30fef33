#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::TransactionConfig;
    use crate::log::Lsn;
    use crate::txn::lock::{LockId, LockManager, LockType};
    use crate::txn::{TxnManager, TxnStatus};

    fn manager() -> TxnManager {
        TxnManager::new(Arc::new(LockManager::new(4)), Duration::from_millis(200))
    }

    #[test]
    fn ids_increase_and_advance() {
        let txns = manager();
        let a = txns.begin(TransactionConfig::default(), false);
        let b = txns.begin(TransactionConfig::default(), true);
        assert!(b.id > a.id);
        assert!(b.auto_commit);

        txns.advance_ids(100);
        let c = txns.begin(TransactionConfig::default(), false);
        assert_eq!(c.id, 101);
        assert_eq!(txns.last_id(), 101);
    }

    #[test]
    fn first_active_lsn_tracks_open_transactions() {
        let txns = manager();
        assert!(txns.first_active_lsn().is_null());

        let a = txns.begin(TransactionConfig::default(), false);
        let b = txns.begin(TransactionConfig::default(), false);
        b.logged(Lsn::new(0, 500));
        a.logged(Lsn::new(0, 900));
        a.logged(Lsn::new(1, 10));
        assert_eq!(a.first_lsn(), Lsn::new(0, 900));
        assert_eq!(a.last_lsn(), Lsn::new(1, 10));
        assert_eq!(txns.first_active_lsn(), Lsn::new(0, 500));

        txns.finish(&b, true);
        assert_eq!(txns.first_active_lsn(), Lsn::new(0, 900));
    }

    #[test]
    fn stats_count_outcomes() {
        let txns = manager();
        let a = txns.begin(TransactionConfig::default(), false);
        let b = txns.begin(TransactionConfig::default(), false);
        txns.finish(&a, true);
        txns.finish(&b, false);
        let _c = txns.begin(TransactionConfig::default(), false);

        let stats = txns.stats(true);
        assert_eq!((stats.begins, stats.commits, stats.aborts, stats.active), (3, 1, 1, 1));
        assert_eq!(txns.stats(false).begins, 0);
    }

    #[test]
    fn must_abort_only_from_open() {
        let txns = manager();
        let txn = txns.begin(TransactionConfig::default(), false);
        txn.set_must_abort();
        assert_eq!(txn.status(), TxnStatus::MustAbort);

        txn.state().status = TxnStatus::Aborted;
        txn.set_must_abort();
        assert_eq!(txn.status(), TxnStatus::Aborted);
    }

    #[test]
    fn per_transaction_timeout_and_no_wait() {
        let txns = manager();
        let holder = txns.begin(TransactionConfig::default(), false);
        holder.locker.lock(LockId::Record(1), LockType::Write).unwrap();

        let impatient = txns.begin(
            TransactionConfig {
                no_wait: true,
                ..TransactionConfig::default()
            },
            false,
        );
        assert!(impatient.locker.lock(LockId::Record(1), LockType::Read).is_err());

        let basic = txns.basic_locker();
        assert!(basic.lock(LockId::Record(2), LockType::Read).is_ok());
    }
}
