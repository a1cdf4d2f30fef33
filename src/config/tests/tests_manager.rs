#[cfg(test)]
mod tests {
    use crate::config::*;

    #[test]
    fn set_bumps_version_and_notifies() {
        let manager = ConfigManager::new(MutableConfig::default());
        let events = manager.subscribe();
        assert_eq!(manager.snapshot().version, 0);

        let version = manager
            .set(MutableConfig {
                run_cleaner: false,
                ..MutableConfig::default()
            })
            .unwrap();
        assert_eq!(version, 1);
        assert!(!manager.snapshot().config.run_cleaner);

        let event = events.try_recv().unwrap();
        assert_eq!(event.snapshot.version, 1);
        assert!(!event.snapshot.config.run_cleaner);
    }

    #[test]
    fn invalid_change_is_not_published() {
        let manager = ConfigManager::new(MutableConfig::default());
        let events = manager.subscribe();

        let result = manager.set(MutableConfig {
            cache_size: 1,
            ..MutableConfig::default()
        });
        assert!(result.is_err());
        assert_eq!(manager.snapshot().version, 0);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let manager = ConfigManager::new(MutableConfig::default());
        drop(manager.subscribe());
        let live = manager.subscribe();

        manager.set(MutableConfig::default()).unwrap();
        manager.set(MutableConfig::default()).unwrap();

        assert_eq!(live.try_iter().count(), 2);
        assert_eq!(manager.subscribers.lock().len(), 1);
    }
}
