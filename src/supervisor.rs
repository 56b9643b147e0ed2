//! Self-healing supervision: a reconciler keeps every daemon in its desired state while
//! the control channel lets clients change that state, until shutdown stops them all.
use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    config::Config,
    control::{self, ControlServer},
    daemon::{self, Supervised},
    error::SupervisorError,
    fault::{self, FaultReceiver},
    group::{self, StopOutcome},
    reconcile::Reconciler,
};

/// Long-lived self-healing supervisor: keeps every daemon in its desired state and
/// lets clients toggle that state over the control channel.
pub struct Supervisor {
    daemons: Vec<Arc<dyn Supervised>>,
    control_addr: String,
    interval: Duration,
    timeout: Duration,
}

impl Supervisor {
    /// Creates a supervisor for every daemon in `config`.
    pub fn new(config: &Config) -> Result<Self, SupervisorError> {
        Ok(Self::with_daemons(
            daemon::daemon_set(config),
            config.control_addr()?,
            config.interval(),
            config.timeout(),
        ))
    }

    /// Creates a supervisor over an explicit daemon set.
    pub fn with_daemons(
        daemons: Vec<Arc<dyn Supervised>>,
        control_addr: impl Into<String>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            daemons,
            control_addr: control_addr.into(),
            interval,
            timeout,
        }
    }

    /// Runs until `shutdown` fires (or its sender goes away), then stops every daemon.
    pub fn run(&self, shutdown: mpsc::Receiver<()>) -> Result<(), SupervisorError> {
        let (faults_tx, faults_rx) = fault::channel();
        spawn_fault_log(faults_rx)?;

        let reconciler =
            Reconciler::new(self.daemons.clone(), self.interval, faults_tx.clone()).spawn()?;

        let server = match ControlServer::bind(
            &self.control_addr,
            Arc::new(control::registry(&self.daemons)),
            faults_tx,
            Some(reconciler.nudger()),
        ) {
            Ok(server) => server,
            Err(err) => {
                error!("Failed to bind control server on {}: {err}", self.control_addr);
                reconciler.shutdown();
                group::stop_all(&self.daemons, self.timeout);
                return Err(err.into());
            }
        };

        info!("Supervisor running with {} daemon(s)", self.daemons.len());
        let _ = shutdown.recv();
        info!("Supervisor shutting down");

        server.shutdown();
        reconciler.shutdown();
        if group::stop_all(&self.daemons, self.timeout) == StopOutcome::TimedOut {
            warn!("Some daemons had to be killed after {:?}", self.timeout);
        }

        Ok(())
    }
}

/// Logs every fault. Recovery is the reconciler's job, so nothing else happens here.
fn spawn_fault_log(faults: FaultReceiver) -> Result<(), SupervisorError> {
    thread::Builder::new()
        .name("fault-log".into())
        .spawn(move || {
            for fault in faults {
                warn!("{fault}");
            }
        })?;
    Ok(())
}
