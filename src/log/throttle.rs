//! Throttling of background log I/O.
//!
//! The cleaner and the checkpointer report their log reads and writes here.
//! Every `limit` operations add one interval to a sleep backlog, and
//! [`BackgroundIo::sleep_after_background_io`] pays the backlog down one
//! interval per call. Callers only call it between entries, with no tree
//! latches held, so foreground threads are never blocked by a sleeping
//! daemon.

use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::{IoSleepHook, MutableConfig};

#[derive(Debug, Default)]
struct IoCounts {
    reads: u32,
    writes: u32,
}

/// Shared read/write throttle of the background daemons.
pub(crate) struct BackgroundIo {
    read_limit: AtomicU32,
    write_limit: AtomicU32,
    sleep_us: AtomicU64,
    counts: Mutex<IoCounts>,
    backlog: AtomicU32,
    hook: Option<IoSleepHook>,
    sleeps: AtomicU64,
}

impl BackgroundIo {
    pub fn new(config: &MutableConfig, hook: Option<IoSleepHook>) -> Self {
        let io = Self {
            read_limit: AtomicU32::new(0),
            write_limit: AtomicU32::new(0),
            sleep_us: AtomicU64::new(0),
            counts: Mutex::new(IoCounts::default()),
            backlog: AtomicU32::new(0),
            hook,
            sleeps: AtomicU64::new(0),
        };
        io.apply(config);
        io
    }

    /// Picks up new limits after a mutable configuration change.
    pub fn apply(&self, config: &MutableConfig) {
        self.read_limit
            .store(config.background_read_limit, Ordering::Relaxed);
        self.write_limit
            .store(config.background_write_limit, Ordering::Relaxed);
        self.sleep_us.store(
            config.background_sleep_interval.as_micros() as u64,
            Ordering::Relaxed,
        );
    }

    /// Records `n` background log reads.
    pub fn update_reads(&self, n: u32) {
        let limit = self.read_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }
        let mut counts = self.counts.lock();
        counts.reads += n;
        while counts.reads >= limit {
            counts.reads -= limit;
            self.backlog.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records `n` background log writes.
    pub fn update_writes(&self, n: u32) {
        let limit = self.write_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }
        let mut counts = self.counts.lock();
        counts.writes += n;
        while counts.writes >= limit {
            counts.writes -= limit;
            self.backlog.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sleeps one interval if any is owed. Must be called with no latches
    /// held.
    pub fn sleep_after_background_io(&self) {
        let owed = self
            .backlog
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| b.checked_sub(1))
            .is_ok();
        if !owed {
            return;
        }
        if let Some(hook) = &self.hook {
            hook();
        }
        let us = self.sleep_us.load(Ordering::Relaxed);
        trace!(sleep_us = us, "background I/O sleep");
        thread::sleep(Duration::from_micros(us));
        self.sleeps.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of sleeps taken so far.
    pub fn sleeps(&self) -> u64 {
        self.sleeps.load(Ordering::Relaxed)
    }

    pub fn clear_stats(&self) {
        self.sleeps.store(0, Ordering::Relaxed);
    }
}
