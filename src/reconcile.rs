//! Self-healing supervision: keep every daemon's liveness equal to its desired state.
use std::{
    io,
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{daemon::Supervised, fault::FaultSender};

/// Messages understood by a running reconciler thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nudge {
    /// Run an extra pass now.
    Reconcile,
    /// Leave the loop.
    Shutdown,
}

/// Periodic desired-vs-actual correction over a fixed daemon set.
pub struct Reconciler {
    daemons: Vec<Arc<dyn Supervised>>,
    interval: Duration,
    faults: FaultSender,
}

impl Reconciler {
    pub fn new(
        daemons: Vec<Arc<dyn Supervised>>,
        interval: Duration,
        faults: FaultSender,
    ) -> Self {
        Self {
            daemons,
            interval,
            faults,
        }
    }

    /// One reconciliation pass; returns how many daemons had to be corrected.
    pub fn pass(&self) -> usize {
        let corrected = self
            .daemons
            .iter()
            .filter_map(|daemon| daemon.ensure_state(&self.faults))
            .count();
        if corrected > 0 {
            debug!("Reconciliation pass corrected {corrected} daemon(s)");
        }
        corrected
    }

    /// Runs the loop on its own thread: one pass immediately, then one per interval.
    pub fn spawn(self) -> io::Result<ReconcilerHandle> {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("reconciler".into())
            .spawn(move || self.run(rx))?;

        Ok(ReconcilerHandle {
            nudger: Nudger(tx),
            thread: Some(thread),
        })
    }

    fn run(self, rx: mpsc::Receiver<Nudge>) {
        info!(
            "Reconciling {} daemon(s) every {:?}",
            self.daemons.len(),
            self.interval
        );
        self.pass();

        let mut next_tick = Instant::now() + self.interval;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(Nudge::Reconcile) => {
                    self.pass();
                }
                Ok(Nudge::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    self.pass();
                    next_tick += self.interval;
                    let now = Instant::now();
                    if next_tick <= now {
                        // A pass overran whole ticks; skip them instead of bursting.
                        next_tick = now + self.interval;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}

/// Requests an immediate pass from a running reconciler.
#[derive(Debug, Clone)]
pub struct Nudger(mpsc::Sender<Nudge>);

impl Nudger {
    pub fn nudge(&self) {
        if self.0.send(Nudge::Reconcile).is_err() {
            debug!("Reconciler already stopped; nudge dropped");
        }
    }
}

/// Owner of a running reconciler thread.
pub struct ReconcilerHandle {
    nudger: Nudger,
    thread: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    pub fn nudger(&self) -> Nudger {
        self.nudger.clone()
    }

    pub fn nudge(&self) {
        self.nudger.nudge();
    }

    /// Stops the ticker and waits for an in-flight pass to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.nudger.0.send(Nudge::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Reconciler thread panicked");
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
