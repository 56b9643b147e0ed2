//! Module for starting, stopping and watching the supervised daemons.
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use nix::{sys::wait::WaitStatus, unistd::Pid};
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, DaemonConfig},
    constants::{
        LIVENESS_POLL_INTERVAL, LOG_POLL_INTERVAL, PID_FILE_READ_ATTEMPTS,
        PID_FILE_READ_INTERVAL,
    },
    error::PidFileError,
    fault::{self, Fault, FaultSender},
    logs::{self, LogEnd},
    process::{self, ProcessHandle},
};

/// Capabilities the supervision strategies need from a daemon.
///
/// The fail-fast [`Group`](crate::group::Group) only uses `start`, `stop` and `kill`;
/// the self-healing [`Reconciler`](crate::reconcile::Reconciler) and the control server
/// additionally drive the desired state through the provided methods.
pub trait Supervised: Send + Sync {
    /// Unique daemon name.
    fn name(&self) -> &str;

    /// Starts the daemon and arms its watchers.
    ///
    /// Failures are posted on `faults` rather than returned. The returned bytes are the
    /// start command's output when it runs to completion (pid-file daemons) and the
    /// failure description when the start failed.
    fn start(&self, faults: &FaultSender) -> Vec<u8>;

    /// Best-effort graceful stop, returning the stop command's output.
    fn stop(&self) -> Vec<u8>;

    /// Forceful stop. A no-op when nothing is tracked.
    fn kill(&self);

    /// Whether the daemon process currently exists.
    fn is_alive(&self) -> bool;

    /// Whether the daemon should currently be running.
    fn is_enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Starts or stops the daemon when desired and observed state disagree.
    fn ensure_state(&self, faults: &FaultSender) -> Option<Transition> {
        match (self.is_enabled(), self.is_alive()) {
            (true, false) => {
                info!("Daemon '{}' should be running; starting it", self.name());
                self.start(faults);
                Some(Transition::Started)
            }
            (false, true) => {
                info!("Daemon '{}' should be stopped; stopping it", self.name());
                self.stop();
                Some(Transition::Stopped)
            }
            _ => None,
        }
    }

    /// Marks the daemon enabled and starts it unless it is already running.
    fn enable(&self, faults: &FaultSender) -> Vec<u8> {
        self.set_enabled(true);
        if self.is_alive() {
            debug!("Daemon '{}' is already running", self.name());
            return Vec::new();
        }
        self.start(faults)
    }

    /// Marks the daemon disabled and stops it.
    fn disable(&self) -> Vec<u8> {
        self.set_enabled(false);
        self.stop()
    }
}

/// Corrective action taken by [`Supervised::ensure_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Stopped,
}

/// Controller for one configured daemon.
#[derive(Debug)]
pub struct Daemon {
    name: String,
    config: DaemonConfig,
    enabled: AtomicBool,
    /// The only shared mutable reference; held briefly, never across a blocking call.
    process: Mutex<Option<ProcessHandle>>,
    /// Serialises starts so two callers cannot both launch a process.
    starting: Mutex<()>,
    /// Incremented by every start; log watchers of older runs retire themselves.
    run: Arc<AtomicU64>,
    liveness_poll: Duration,
    pid_file_attempts: usize,
    pid_file_interval: Duration,
}

impl Daemon {
    /// Creates a controller in its configured initial desired state.
    pub fn new(name: impl Into<String>, config: DaemonConfig) -> Self {
        let enabled = config.enabled;
        Self {
            name: name.into(),
            config,
            enabled: AtomicBool::new(enabled),
            process: Mutex::new(None),
            starting: Mutex::new(()),
            run: Arc::new(AtomicU64::new(0)),
            liveness_poll: LIVENESS_POLL_INTERVAL,
            pid_file_attempts: PID_FILE_READ_ATTEMPTS,
            pid_file_interval: PID_FILE_READ_INTERVAL,
        }
    }

    /// Builds one controller per configured daemon, in name order.
    pub fn from_config(config: &Config) -> Vec<Arc<Daemon>> {
        config
            .daemons
            .iter()
            .map(|(name, daemon)| Arc::new(Daemon::new(name.clone(), daemon.clone())))
            .collect()
    }

    /// Overrides how often a daemon that is not our child is probed.
    pub fn with_liveness_poll(mut self, interval: Duration) -> Self {
        self.liveness_poll = interval;
        self
    }

    /// Overrides the pid-file discovery budget.
    pub fn with_pid_file_budget(mut self, attempts: usize, interval: Duration) -> Self {
        self.pid_file_attempts = attempts;
        self.pid_file_interval = interval;
        self
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// The tracked process handle, if a start ever succeeded.
    pub fn process(&self) -> Option<ProcessHandle> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_process(&self, handle: ProcessHandle) {
        *self.process.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Resolves the daemon PID.
    ///
    /// With a pid-file the file is read and parsed; absent or unparsable content yields
    /// `None`. Without one the tracked child's PID is returned.
    pub fn pid(&self) -> Option<Pid> {
        match &self.config.pid_file {
            Some(path) => match read_pid_file(path) {
                Ok(pid) => Some(pid),
                Err(err) => {
                    debug!("No PID for daemon '{}' from {:?}: {err}", self.name, path);
                    None
                }
            },
            None => self.process().map(|handle| handle.pid()),
        }
    }

    /// Spawns the command as a direct child and waits on it in the background.
    fn start_foreground(&self, argv: &[String], faults: &FaultSender) -> Vec<u8> {
        match ProcessHandle::spawn(argv) {
            Ok(handle) => {
                info!("Daemon '{}' started with PID {}", self.name, handle.pid());
                self.set_process(handle.clone());
                self.spawn_death_watcher(handle, faults);
                Vec::new()
            }
            Err(err) => self.start_failed(err.to_string(), Vec::new(), faults),
        }
    }

    /// Runs a self-backgrounding command, then adopts the PID it writes.
    fn start_background(
        &self,
        argv: &[String],
        pid_file: &Path,
        faults: &FaultSender,
    ) -> Vec<u8> {
        // Make sure the PID read below was written by this start.
        if let Err(err) = fs::write(pid_file, b"") {
            debug!("Could not clear pid file {:?}: {err}", pid_file);
        }

        let output = match process::run_command(argv) {
            Ok(result) if result.status.success() => result.output,
            Ok(result) => {
                let reason = format!("start command exited with {}", result.status);
                return self.start_failed(reason, result.output, faults);
            }
            Err(err) => return self.start_failed(err.to_string(), Vec::new(), faults),
        };

        match read_pid_file_retry(pid_file, self.pid_file_attempts, self.pid_file_interval)
        {
            Some(pid) => {
                info!(
                    "Daemon '{}' started with PID {pid} from {:?}",
                    self.name, pid_file
                );
                let handle = ProcessHandle::adopt(pid);
                self.set_process(handle.clone());
                self.spawn_death_watcher(handle, faults);
                output
            }
            None => {
                let reason = format!("pid file {:?} was never populated", pid_file);
                self.start_failed(reason, output, faults)
            }
        }
    }

    fn start_failed(&self, reason: String, output: Vec<u8>, faults: &FaultSender) -> Vec<u8> {
        error!("Failed to start daemon '{}': {reason}", self.name);
        let fault = Fault::StartFailed {
            daemon: self.name.clone(),
            reason,
        };

        let mut reply = output;
        if !reply.is_empty() && !reply.ends_with(b"\n") {
            reply.push(b'\n');
        }
        reply.extend_from_slice(fault.to_string().as_bytes());

        fault::post(faults, fault);
        reply
    }

    /// Posts [`Fault::Died`] once `handle` goes away.
    fn spawn_death_watcher(&self, handle: ProcessHandle, faults: &FaultSender) {
        let name = self.name.clone();
        let faults = faults.clone();
        let poll = self.liveness_poll;

        thread::spawn(move || {
            match handle.wait_for_exit(poll) {
                Some(WaitStatus::Exited(_, 0)) => info!("Daemon '{name}' exited normally."),
                Some(status) => warn!("Daemon '{name}' was terminated with {status:?}."),
                None => info!("Daemon '{name}' is no longer running."),
            }
            fault::post(&faults, Fault::Died { daemon: name });
        });
    }

    /// Streams every log file of run `run` to stdout until it breaks.
    fn spawn_log_watchers(&self, run: u64, faults: &FaultSender) {
        for path in &self.config.log_files {
            let name = self.name.clone();
            let path: PathBuf = path.clone();
            let faults = faults.clone();
            let current = Arc::clone(&self.run);

            thread::spawn(move || {
                let result = logs::follow(
                    &path,
                    LOG_POLL_INTERVAL,
                    || current.load(Ordering::SeqCst) == run,
                    |line| {
                        let _ = writeln!(io::stdout().lock(), "{line}");
                    },
                );

                match result {
                    Ok(LogEnd::Cancelled) => {
                        debug!("Stopped following {:?} for '{name}' after a restart", path);
                        return;
                    }
                    Ok(end) => warn!("Log stream {:?} of '{name}' ended: {end:?}", path),
                    Err(err) => warn!("Could not follow {:?} for '{name}': {err}", path),
                }
                fault::post(&faults, Fault::LogStreamEnded { daemon: name, path });
            });
        }
    }
}

impl Supervised for Daemon {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self, faults: &FaultSender) -> Vec<u8> {
        let _starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_alive() {
            debug!("Daemon '{}' is already running; not starting it again", self.name);
            return Vec::new();
        }

        let argv = self.config.command.argv();
        info!("Starting `{}` daemon with command: {:?}", self.name, argv);

        let run = self.run.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_log_watchers(run, faults);

        match &self.config.pid_file {
            None => self.start_foreground(&argv, faults),
            Some(pid_file) => self.start_background(&argv, pid_file, faults),
        }
    }

    fn stop(&self) -> Vec<u8> {
        if let Some(stop_command) = &self.config.stop_command {
            let argv = stop_command.argv();
            info!("Stopping daemon '{}' with command: {:?}", self.name, argv);
            return match process::run_command(&argv) {
                Ok(result) => {
                    if !result.status.success() {
                        warn!(
                            "Stop command of daemon '{}' exited with {}",
                            self.name, result.status
                        );
                    }
                    result.output
                }
                Err(err) => {
                    warn!("Failed to run stop command of daemon '{}': {err}", self.name);
                    Vec::new()
                }
            };
        }

        match self.process() {
            Some(handle) => {
                debug!("Sending SIGTERM to daemon '{}' (PID {})", self.name, handle.pid());
                handle.terminate();
            }
            None => debug!("Daemon '{}' has no tracked process to stop", self.name),
        }
        Vec::new()
    }

    fn kill(&self) {
        if let Some(handle) = self.process()
            && handle.kill()
        {
            warn!("Killed daemon '{}' (PID {})", self.name, handle.pid());
        }
    }

    fn is_alive(&self) -> bool {
        match &self.config.pid_file {
            Some(_) => self.pid().is_some_and(process::probe),
            None => self.process().is_some_and(|handle| handle.is_alive()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Builds the daemon set of `config` for the supervision strategies.
pub fn daemon_set(config: &Config) -> Vec<Arc<dyn Supervised>> {
    Daemon::from_config(config)
        .into_iter()
        .map(|daemon| daemon as Arc<dyn Supervised>)
        .collect()
}

/// Reads a decimal PID, tolerating surrounding whitespace.
pub fn read_pid_file(path: &Path) -> Result<Pid, PidFileError> {
    let contents = fs::read_to_string(path)?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(PidFileError::Empty);
    }

    let pid: i32 = trimmed.parse()?;
    if pid <= 0 {
        return Err(PidFileError::NotPositive(pid));
    }
    Ok(Pid::from_raw(pid))
}

/// Polls `path` until it holds a PID or `attempts` reads came back empty.
fn read_pid_file_retry(path: &Path, attempts: usize, interval: Duration) -> Option<Pid> {
    for attempt in 0..attempts {
        if let Ok(pid) = read_pid_file(path) {
            return Some(pid);
        }
        if attempt + 1 < attempts {
            thread::sleep(interval);
        }
    }
    None
}
