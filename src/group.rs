//! Fail-fast supervision: the whole group lives and dies together.
use std::{
    sync::{Arc, mpsc},
    thread,
    time::{Duration, Instant},
};

use tracing::{error, info, warn};

use crate::{
    daemon::Supervised,
    fault::{self, Fault, FaultReceiver, FaultSender},
};

/// How a group stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every graceful stop returned before the deadline.
    Graceful,
    /// The deadline passed with graceful stops still running.
    TimedOut,
}

/// A set of daemons started together and torn down on the first fault.
pub struct Group {
    daemons: Vec<Arc<dyn Supervised>>,
    timeout: Duration,
}

impl Group {
    pub fn new(daemons: Vec<Arc<dyn Supervised>>, timeout: Duration) -> Self {
        Self { daemons, timeout }
    }

    /// Starts every daemon, waits for the first fault, then stops the group.
    pub fn run(&self) -> Fault {
        let (faults_tx, faults_rx) = fault::channel();
        self.run_with(faults_tx, faults_rx)
    }

    /// Like [`Group::run`] on a caller-provided channel, so faults from outside the
    /// group (a termination signal) can end it too.
    ///
    /// Disabled daemons are left out entirely: never started, stopped or killed.
    pub fn run_with(&self, faults_tx: FaultSender, faults_rx: FaultReceiver) -> Fault {
        let (members, skipped): (Vec<_>, Vec<_>) = self
            .daemons
            .iter()
            .cloned()
            .partition(|daemon| daemon.is_enabled());
        for daemon in &skipped {
            info!("Daemon '{}' is disabled; not starting it", daemon.name());
        }

        for daemon in &members {
            daemon.start(&faults_tx);
        }
        info!("Started {} daemon(s)", members.len());

        // Keeping our own sender alive means `recv` cannot fail while we wait.
        let fault = faults_rx.recv().unwrap_or(Fault::Terminated);
        error!("{fault}");

        stop_all(&members, self.timeout);
        fault
    }
}

/// Stops every daemon concurrently, then kills them all.
///
/// Each graceful stop gets its own thread. If they have not all returned after
/// `timeout` they are abandoned. Every daemon is force-killed afterwards either way,
/// which is a no-op for the ones that already went away. Returns after roughly
/// `timeout` at most.
pub fn stop_all(daemons: &[Arc<dyn Supervised>], timeout: Duration) -> StopOutcome {
    let started = Instant::now();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    {
        let daemons = daemons.to_vec();
        thread::spawn(move || {
            let stops: Vec<_> = daemons
                .into_iter()
                .map(|daemon| {
                    thread::spawn(move || {
                        info!("Stopping daemon '{}'", daemon.name());
                        daemon.stop();
                    })
                })
                .collect();
            for stop in stops {
                let _ = stop.join();
            }
            let _ = done_tx.send(());
        });
    }

    let outcome = match done_rx.recv_timeout(timeout) {
        Ok(()) => StopOutcome::Graceful,
        Err(_) => {
            warn!(
                "Graceful stop did not finish within {:?}; killing remaining daemons",
                timeout
            );
            StopOutcome::TimedOut
        }
    };

    for daemon in daemons {
        daemon.kill();
    }

    info!("Group stopped in {:?} ({outcome:?})", started.elapsed());
    outcome
}
