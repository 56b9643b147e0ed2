//! Text control channel used to toggle daemons in a running supervisor.
//!
//! One command per TCP connection: the client writes `"<action> <daemon>\n"`, the server
//! replies with the operation's output followed by a newline and closes the connection.
use std::{
    collections::BTreeMap,
    fmt,
    io::{self, BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    constants::{CONTROL_ACCEPT_INTERVAL, CONTROL_CONNECT_TIMEOUT, CONTROL_READ_TIMEOUT},
    daemon::Supervised,
    fault::FaultSender,
    reconcile::Nudger,
};

/// Daemons reachable through the control channel, by name.
pub type Registry = BTreeMap<String, Arc<dyn Supervised>>;

/// Builds a [`Registry`] from a daemon set.
pub fn registry(daemons: &[Arc<dyn Supervised>]) -> Registry {
    daemons
        .iter()
        .map(|daemon| (daemon.name().to_string(), Arc::clone(daemon)))
        .collect()
}

/// Errors raised by the control channel.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("could not find daemon `{0}`")]
    UnknownDaemon(String),

    #[error("wrong command `{0}`")]
    WrongCommand(String),

    #[error("supervisor closed the connection without replying")]
    EmptyReply,

    #[error("invalid control port `{0}`")]
    InvalidPort(String),
}

/// Operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ControlAction {
    /// Enable the daemon and start it if it is not running.
    Start,
    /// Disable the daemon and stop it.
    Stop,
}

/// A single request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub action: ControlAction,
    pub daemon: String,
}

impl ControlCommand {
    pub fn new(action: ControlAction, daemon: impl Into<String>) -> Self {
        Self {
            action,
            daemon: daemon.into(),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.daemon)
    }
}

/// Resolves a request line against `registry`.
///
/// The daemon name is checked before the action, so a request naming an unknown daemon
/// reports the daemon even when the action is wrong too.
pub fn resolve<'a>(
    line: &str,
    registry: &'a Registry,
) -> Result<(ControlAction, &'a Arc<dyn Supervised>), ControlError> {
    let request = line.trim();
    let tokens: Vec<&str> = request.split_whitespace().collect();
    let [action, name] = tokens.as_slice() else {
        return Err(ControlError::WrongCommand(request.to_string()));
    };

    let daemon = registry
        .get(*name)
        .ok_or_else(|| ControlError::UnknownDaemon(name.to_string()))?;
    let action = action
        .parse::<ControlAction>()
        .map_err(|_| ControlError::WrongCommand(request.to_string()))?;

    Ok((action, daemon))
}

/// Accept loop serving control requests on a background thread.
pub struct ControlServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds `addr` and starts serving.
    ///
    /// Successful actions nudge the reconciler, when one is given, so the new desired
    /// state is enforced without waiting for the next tick.
    pub fn bind(
        addr: &str,
        registry: Arc<Registry>,
        faults: FaultSender,
        nudger: Option<Nudger>,
    ) -> Result<Self, ControlError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let accept_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("control".into())
            .spawn(move || {
                accept_loop(listener, &accept_running, registry, faults, nudger);
            })?;

        info!("Control server listening on {local_addr}");
        Ok(Self {
            local_addr,
            running,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listener. Connections already accepted are allowed to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("Control accept thread panicked");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    running: &AtomicBool,
    registry: Arc<Registry>,
    faults: FaultSender,
    nudger: Option<Nudger>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("Control connection from {peer}");
                let registry = Arc::clone(&registry);
                let faults = faults.clone();
                let nudger = nudger.clone();
                thread::spawn(move || {
                    if let Err(err) = serve(stream, &registry, &faults, nudger.as_ref()) {
                        warn!("Control connection from {peer} failed: {err}");
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(CONTROL_ACCEPT_INTERVAL);
            }
            Err(err) => {
                warn!("Failed to accept control connection: {err}");
                thread::sleep(CONTROL_ACCEPT_INTERVAL);
            }
        }
    }
    info!("Control server stopped");
}

/// Handles exactly one request on `stream`.
fn serve(
    stream: TcpStream,
    registry: &Registry,
    faults: &FaultSender,
    nudger: Option<&Nudger>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CONTROL_READ_TIMEOUT))?;

    let mut line = String::new();
    BufReader::new(&stream).read_line(&mut line)?;

    let mut reply = match resolve(&line, registry) {
        Ok((action, daemon)) => {
            info!("Control request: {action} {}", daemon.name());
            let output = match action {
                ControlAction::Start => daemon.enable(faults),
                ControlAction::Stop => daemon.disable(),
            };
            if let Some(nudger) = nudger {
                nudger.nudge();
            }
            output
        }
        Err(err) => {
            warn!("Rejected control request {:?}: {err}", line.trim());
            err.to_string().into_bytes()
        }
    };

    if !reply.ends_with(b"\n") {
        reply.push(b'\n');
    }
    (&stream).write_all(&reply)?;
    (&stream).flush()
}

/// Parses a configured port, accepting an optional leading `:`.
pub fn parse_port(raw: &str) -> Result<u16, ControlError> {
    raw.trim()
        .trim_start_matches(':')
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ControlError::InvalidPort(raw.to_string()))
}

/// Sends `command` to the supervisor at `addr` and returns its reply.
///
/// The reply is read until the server closes the connection; one trailing newline is
/// removed. The server only replies once the operation finished, which includes running
/// a stop command or waiting for a pid-file, so the read has no deadline.
pub fn send_command(addr: &str, command: &ControlCommand) -> Result<String, ControlError> {
    let mut stream = connect(addr)?;
    stream.set_read_timeout(None)?;

    stream.write_all(format!("{command}\n").as_bytes())?;
    stream.flush()?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply)?;
    if reply.is_empty() {
        return Err(ControlError::EmptyReply);
    }

    let mut reply = String::from_utf8_lossy(&reply).into_owned();
    if reply.ends_with('\n') {
        reply.pop();
    }
    Ok(reply)
}

fn connect(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = None;
    for socket in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&socket, CONTROL_CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("no address for {addr}"))
    }))
}
