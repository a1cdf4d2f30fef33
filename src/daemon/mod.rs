//! Background daemons.
//!
//! Four threads keep an open environment healthy: the checkpointer, the
//! cleaner, the compressor and the evictor. Each one waits on a crossbeam
//! `select!` over its shutdown channel, its config-event queue, an optional
//! wake channel and a poll timeout, and runs one pass of its work when it
//! wakes and its `run_*` toggle is on.
//!
//! Shutdown drops the shutdown sender; every daemon sees the disconnect on
//! its next wake-up, finishes the pass it is in and exits. The threads are
//! joined before the environment is closed.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, select};
use tracing::{debug, error, info};

use crate::Error;
use crate::cleaner;
use crate::config::{ConfigEvent, EnvironmentConfig, MutableConfig};
use crate::env::{EnvironmentImpl, compress, evictor};
use crate::recovery::checkpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Daemon {
    Checkpointer,
    Cleaner,
    Compressor,
    Evictor,
}

impl Daemon {
    const ALL: [Daemon; 4] = [
        Daemon::Checkpointer,
        Daemon::Cleaner,
        Daemon::Compressor,
        Daemon::Evictor,
    ];

    fn name(self) -> &'static str {
        match self {
            Daemon::Checkpointer => "checkpointer",
            Daemon::Cleaner => "cleaner",
            Daemon::Compressor => "compressor",
            Daemon::Evictor => "evictor",
        }
    }

    fn enabled(self, config: &MutableConfig) -> bool {
        match self {
            Daemon::Checkpointer => config.run_checkpointer,
            Daemon::Cleaner => config.run_cleaner,
            Daemon::Compressor => config.run_compressor,
            Daemon::Evictor => config.run_evictor,
        }
    }

    fn interval(self, config: &EnvironmentConfig) -> Duration {
        match self {
            Daemon::Compressor => config.compressor_wakeup_interval,
            _ => config.daemon_wakeup_interval,
        }
    }

    fn wake_channel(self, env: &EnvironmentImpl) -> Receiver<()> {
        match self {
            Daemon::Compressor => env.compressor.wake_receiver(),
            _ => channel::never(),
        }
    }

    /// One pass of work.
    fn work(self, env: &EnvironmentImpl, config: &MutableConfig) -> Result<(), Error> {
        match self {
            Daemon::Checkpointer => {
                checkpoint::run(env, false, "daemon")?;
            }
            Daemon::Cleaner => {
                let written = env.log.bytes_written();
                if env
                    .cleaner
                    .bytes_interval_elapsed(written, config.cleaner_bytes_interval)
                {
                    let cleaned = cleaner::clean_log(env, true, false)?;
                    if cleaned > 0 {
                        debug!(cleaned, "cleaner daemon pass");
                    }
                }
            }
            Daemon::Compressor => {
                compress::run(env)?;
            }
            Daemon::Evictor => {
                let run = evictor::evict_memory(env)?;
                if run.nodes_evicted > 0 || run.lns_stripped > 0 {
                    debug!(
                        nodes = run.nodes_evicted,
                        lns = run.lns_stripped,
                        "evictor daemon pass"
                    );
                }
            }
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Thread set
// ------------------------------------------------------------------------------------------------

/// The running daemon threads of one environment.
pub(crate) struct Daemons {
    shutdown: Option<Sender<()>>,
    threads: Vec<(&'static str, thread::JoinHandle<()>)>,
}

impl Daemons {
    /// Starts every daemon. A read-only environment gets none.
    ///
    /// # Errors
    ///
    /// `Io` if a thread cannot be spawned; the threads already started are
    /// stopped first.
    pub fn start(env: &Arc<EnvironmentImpl>) -> Result<Self, Error> {
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let mut daemons = Self {
            shutdown: Some(shutdown_tx),
            threads: Vec::new(),
        };
        if env.config.read_only {
            return Ok(daemons);
        }
        for daemon in Daemon::ALL {
            let env = Arc::clone(env);
            let shutdown = shutdown_rx.clone();
            let events = env.mutable.subscribe();
            let wake = daemon.wake_channel(&env);
            let spawned = thread::Builder::new()
                .name(format!("arborlog-{}", daemon.name()))
                .spawn(move || run_loop(&env, daemon, &shutdown, &events, &wake));
            match spawned {
                Ok(handle) => daemons.threads.push((daemon.name(), handle)),
                Err(e) => {
                    daemons.stop();
                    return Err(e.into());
                }
            }
        }
        debug!(count = daemons.threads.len(), "daemons started");
        Ok(daemons)
    }

    /// Signals every daemon and joins it. Calling `stop` again does nothing.
    pub fn stop(&mut self) {
        // Disconnecting the channel wakes every select.
        drop(self.shutdown.take());
        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(daemon = name, "daemon thread panicked");
            }
        }
    }

    pub fn running(&self) -> usize {
        self.threads.len()
    }
}

impl Drop for Daemons {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    env: &EnvironmentImpl,
    daemon: Daemon,
    shutdown: &Receiver<()>,
    events: &Receiver<ConfigEvent>,
    wake: &Receiver<()>,
) {
    let name = daemon.name();
    let interval = daemon.interval(&env.config);
    let mut config = env.mutable.snapshot().config.clone();
    debug!(daemon = name, ?interval, "daemon running");
    loop {
        select! {
            recv(shutdown) -> _ => break,
            recv(events) -> event => {
                if let Ok(event) = event {
                    debug!(daemon = name, version = event.snapshot.version, "daemon picked up config");
                    config = event.snapshot.config.clone();
                }
                continue;
            }
            recv(wake) -> _ => {}
            default(interval) => {}
        }
        if env.is_closed() {
            break;
        }
        if !env.validity.is_valid() {
            info!(daemon = name, "environment invalidated, daemon exiting");
            break;
        }
        if !daemon.enabled(&config) {
            continue;
        }
        if let Err(e) = env.guard(daemon.work(env, &config)) {
            error!(daemon = name, error = %e, "daemon pass failed");
        }
    }
    debug!(daemon = name, "daemon stopped");
}
