//! Process-wide reaper of exited children.
//!
//! When hydre is the init process of a container, every orphan in the namespace is
//! re-parented to it and must be waited on or it lingers as a zombie. The reaper is a
//! single service, started once at boot, that drains all waitable children whenever
//! `SIGCHLD` arrives. Outside of an init role it only collects hydre's own children,
//! which the daemon watchers already tolerate.
//!
//! Code that needs a command's exit status spawns it with [`spawn_tracked`] and collects
//! it with [`wait_tracked`]. If the reaper wins the race for a tracked child it hands
//! the status over instead of dropping it, so neither side ever waits on the other.
use std::{
    collections::BTreeMap,
    io,
    process::{Child, Command},
    sync::{
        Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use nix::{
    errno::Errno,
    sys::wait::{WaitPidFlag, WaitStatus, waitpid},
    unistd::{Pid, getpid},
};
use signal_hook::{consts::signal::SIGCHLD, iterator::Signals};
use tracing::{debug, info, warn};

/// Tracked children by PID, with the status the reaper collected on their behalf.
static IN_FLIGHT: Mutex<BTreeMap<i32, Option<WaitStatus>>> = Mutex::new(BTreeMap::new());

/// Signalled whenever the reaper records the status of a tracked child.
static COLLECTED: Condvar = Condvar::new();

static REAPER: OnceLock<Reaper> = OnceLock::new();

/// Handle to the running reaper service.
#[derive(Debug)]
pub struct Reaper {
    reaped: AtomicU64,
}

impl Reaper {
    /// Installs the `SIGCHLD` subscription and the reaping thread.
    ///
    /// Only the first call installs anything; later calls return the running instance.
    pub fn start() -> io::Result<&'static Reaper> {
        static INSTALL: Mutex<()> = Mutex::new(());
        let _install = INSTALL.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(reaper) = REAPER.get() {
            return Ok(reaper);
        }

        let mut signals = Signals::new([SIGCHLD])?;
        let reaper = REAPER.get_or_init(|| Reaper {
            reaped: AtomicU64::new(0),
        });

        thread::Builder::new()
            .name("reaper".into())
            .spawn(move || {
                // Children that exited before the subscription existed.
                reaper.record(reap_children());
                for _ in signals.forever() {
                    reaper.record(reap_children());
                }
            })?;

        let pid = getpid();
        if pid.as_raw() == 1 {
            info!("Reaper installed; running as init, orphans will be collected");
        } else {
            debug!("Reaper installed for PID {pid}");
        }

        Ok(reaper)
    }

    /// Returns the running reaper, if [`Reaper::start`] was called.
    pub fn get() -> Option<&'static Reaper> {
        REAPER.get()
    }

    /// Number of children collected by the signal-driven loop so far.
    pub fn reaped(&self) -> u64 {
        self.reaped.load(Ordering::Relaxed)
    }

    fn record(&self, count: usize) {
        self.reaped.fetch_add(count as u64, Ordering::Relaxed);
    }
}

fn in_flight() -> MutexGuard<'static, BTreeMap<i32, Option<WaitStatus>>> {
    IN_FLIGHT.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns `command` and registers the child so its exit status survives the reaper.
///
/// The child must be collected with [`wait_tracked`].
pub fn spawn_tracked(command: &mut Command) -> io::Result<Child> {
    // Registration happens under the lock the reaper needs to record a status, so a
    // child that exits immediately is still recognised as tracked.
    let mut in_flight = in_flight();
    let child = command.spawn()?;
    in_flight.insert(child.id() as i32, None);
    Ok(child)
}

/// Blocks until the tracked child `pid` exited and returns its status.
pub fn wait_tracked(pid: Pid) -> io::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                in_flight().remove(&pid.as_raw());
                return Ok(status);
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(err) => {
                in_flight().remove(&pid.as_raw());
                return Err(err.into());
            }
        }
    }

    // The reaper collected the child; wait for it to publish the status.
    let mut in_flight = in_flight();
    loop {
        match in_flight.get(&pid.as_raw()) {
            Some(Some(status)) => {
                let status = *status;
                in_flight.remove(&pid.as_raw());
                return Ok(status);
            }
            Some(None) => {
                in_flight = COLLECTED
                    .wait(in_flight)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("PID {pid} is not a tracked child"),
                ));
            }
        }
    }
}

/// Hands `status` to a [`wait_tracked`] caller if `pid` is tracked.
fn publish(pid: Pid, status: WaitStatus) {
    let mut in_flight = in_flight();
    if let Some(slot) = in_flight.get_mut(&pid.as_raw()) {
        *slot = Some(status);
        COLLECTED.notify_all();
    }
}

/// Collects every child that can be reaped right now and returns how many were.
pub fn reap_children() -> usize {
    let mut count = 0;

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(pid) = status.pid() {
                    debug!("Reaped PID {pid}: {status:?}");
                    if matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
                        publish(pid, status);
                    }
                    count += 1;
                }
            }
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(err) => {
                warn!("Reaper waitpid failed: {err}");
                break;
            }
        }
    }

    count
}
