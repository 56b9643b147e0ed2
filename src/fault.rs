//! Fault events posted when a supervised resource stops working.
//!
//! Every watcher owns a [`FaultSender`] clone and posts exactly one event before it
//! terminates. The channel is unbounded so a watcher never blocks on a consumer that
//! is busy shutting the group down.
use std::{path::PathBuf, sync::mpsc};

use thiserror::Error;
use tracing::debug;

/// A supervised resource stopped functioning.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// The start command could not be spawned or the pid-file never filled up.
    #[error("could not start daemon `{daemon}` : {reason}")]
    StartFailed { daemon: String, reason: String },

    /// The daemon process exited after a successful start.
    #[error("daemon `{daemon}` has stopped")]
    Died { daemon: String },

    /// A followed log file ended or became unreadable.
    #[error("could not stream logs from `{}`", path.display())]
    LogStreamEnded { daemon: String, path: PathBuf },

    /// The supervisor itself was asked to terminate.
    #[error("received termination signal")]
    Terminated,
}

impl Fault {
    /// Name of the daemon the fault belongs to, if any.
    pub fn daemon(&self) -> Option<&str> {
        match self {
            Fault::StartFailed { daemon, .. }
            | Fault::Died { daemon }
            | Fault::LogStreamEnded { daemon, .. } => Some(daemon),
            Fault::Terminated => None,
        }
    }
}

pub type FaultSender = mpsc::Sender<Fault>;
pub type FaultReceiver = mpsc::Receiver<Fault>;

/// Creates the shared fault channel.
pub fn channel() -> (FaultSender, FaultReceiver) {
    mpsc::channel()
}

/// Posts `fault`, ignoring a consumer that already went away.
pub fn post(faults: &FaultSender, fault: Fault) {
    if let Err(mpsc::SendError(fault)) = faults.send(fault) {
        debug!("Fault channel closed; dropping `{fault}`");
    }
}
