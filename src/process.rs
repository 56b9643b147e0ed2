//! OS process references: spawning, probing, signalling and waiting.
use std::{
    fs,
    io::{self, Read, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Command, ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{WaitStatus, waitpid},
    },
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::reaper;

/// How long to keep collecting output after a command exited while a background
/// process it left behind still holds the pipe open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(100);

/// Whether the supervisor spawned the process or only knows its PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Spawned by us, waitable, leader of its own process group.
    Child,
    /// Discovered through a pid-file; may belong to any parent.
    Adopted,
}

/// Reference to a supervised OS process.
///
/// Clones share the "exit observed" flag, so once any clone has seen the process go
/// away every clone stops delivering signals to a PID the kernel may have recycled.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Pid,
    ownership: Ownership,
    exited: Arc<AtomicBool>,
}

impl ProcessHandle {
    /// Spawns `argv` as a direct child in its own process group.
    ///
    /// Standard output and error are inherited so daemon output lands on the
    /// supervisor's streams; standard input is `/dev/null`.
    pub fn spawn(argv: &[String]) -> io::Result<Self> {
        let (program, args) = split_argv(argv)?;
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()?;

        let pid = Pid::from_raw(child.id() as i32);
        debug!("Spawned `{}` with PID {pid}", argv.join(" "));

        // Waiting happens through the pid; dropping `Child` neither waits nor kills.
        drop(child);

        Ok(Self {
            pid,
            ownership: Ownership::Child,
            exited: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Wraps a PID that need not be our child.
    pub fn adopt(pid: Pid) -> Self {
        Self {
            pid,
            ownership: Ownership::Adopted,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// True once a watcher has observed the process go away.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Recomputes liveness from the OS.
    pub fn is_alive(&self) -> bool {
        !self.has_exited() && probe(self.pid)
    }

    /// Delivers `sig`, returning whether the process received it.
    ///
    /// Signalling a process that already exited is a silent no-op. Children are also
    /// signalled through their process group so helpers they forked go down with them.
    pub fn signal(&self, sig: Signal) -> bool {
        if self.has_exited() {
            debug!("PID {} already exited; not sending {sig}", self.pid);
            return false;
        }

        if self.ownership == Ownership::Child {
            match signal::killpg(self.pid, sig) {
                Ok(()) => debug!("Sent {sig} to process group {}", self.pid),
                Err(Errno::ESRCH) => {}
                Err(err) => warn!("Failed to signal process group {}: {err}", self.pid),
            }
        }

        match signal::kill(self.pid, sig) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(err) => {
                warn!("Failed to send {sig} to PID {}: {err}", self.pid);
                false
            }
        }
    }

    /// Requests a graceful exit with `SIGTERM`.
    pub fn terminate(&self) -> bool {
        self.signal(Signal::SIGTERM)
    }

    /// Forces an exit with `SIGKILL`.
    pub fn kill(&self) -> bool {
        self.signal(Signal::SIGKILL)
    }

    /// Blocks until the process is gone.
    ///
    /// Children are waited on and their exit status returned. `None` means the status
    /// was collected elsewhere (the reaper) or the process is adopted, in which case
    /// liveness is polled every `poll` instead.
    pub fn wait_for_exit(&self, poll: Duration) -> Option<WaitStatus> {
        let status = match self.ownership {
            Ownership::Child => self.wait_child(),
            Ownership::Adopted => {
                while self.is_alive() {
                    thread::sleep(poll);
                }
                None
            }
        };
        self.mark_exited();
        status
    }

    fn wait_child(&self) -> Option<WaitStatus> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    return Some(status);
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return None,
                Err(err) => {
                    warn!("waitpid({}) failed: {err}", self.pid);
                    return None;
                }
            }
        }
    }
}

/// Checks whether `pid` names a live process.
///
/// `kill(pid, 0)` alone reports zombies as alive, so on Linux the process state in
/// `/proc` is consulted as well.
pub fn probe(pid: Pid) -> bool {
    if pid.as_raw() <= 0 {
        return false;
    }

    match signal::kill(pid, None) {
        Ok(()) => !is_zombie(pid),
        // The process exists but belongs to someone we may not signal.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };

    // The state character follows the parenthesised command name, which may itself
    // contain spaces or parentheses.
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: Pid) -> bool {
    false
}

/// Result of a command run to completion.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    /// Standard output and error, interleaved in arrival order.
    pub output: Vec<u8>,
}

/// Runs `argv` to completion, echoing and capturing its output.
///
/// Output is forwarded to the supervisor's own stdout/stderr as it arrives. A command
/// that backgrounds a process may leave that process holding the pipes; the capture
/// then stops shortly after the command itself exits and the forwarding threads keep
/// relaying whatever the background process writes later.
pub fn run_command(argv: &[String]) -> io::Result<CommandOutput> {
    let (program, args) = split_argv(argv)?;
    let (copies_tx, copies_rx) = mpsc::channel::<Vec<u8>>();

    let mut child = reaper::spawn_tracked(
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped()),
    )?;

    if let Some(stdout) = child.stdout.take() {
        forward(stdout, io::stdout(), copies_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward(stderr, io::stderr(), copies_tx.clone());
    }
    drop(copies_tx);

    let pid = Pid::from_raw(child.id() as i32);
    drop(child);
    let status = exit_status(reaper::wait_tracked(pid)?);

    let mut output = Vec::new();
    while let Ok(chunk) = copies_rx.recv_timeout(OUTPUT_DRAIN_GRACE) {
        output.extend_from_slice(&chunk);
    }

    Ok(CommandOutput { status, output })
}

/// Encodes a terminal wait status the way `waitpid` reports it.
fn exit_status(status: WaitStatus) -> ExitStatus {
    let raw = match status {
        WaitStatus::Exited(_, code) => (code & 0xff) << 8,
        WaitStatus::Signaled(_, sig, core) => sig as i32 | if core { 0x80 } else { 0 },
        _ => 0,
    };
    ExitStatus::from_raw(raw)
}

/// Relays `source` into `sink` on a background thread, sending a copy of every chunk.
fn forward<R, W>(mut source: R, mut sink: W, copies: mpsc::Sender<Vec<u8>>)
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = sink.write_all(&buf[..n]);
                    let _ = sink.flush();
                    // The receiver is gone once the command result was returned.
                    let _ = copies.send(buf[..n].to_vec());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn split_argv(argv: &[String]) -> io::Result<(&String, &[String])> {
    argv.split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))
}
