#![allow(dead_code)]

use std::{
    fs,
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes `yaml` as `hydre.yml` under `dir`.
pub fn write_config(dir: &Path, yaml: &str) -> PathBuf {
    let path = dir.join("hydre.yml");
    fs::write(&path, yaml).expect("failed to write config");
    path
}

/// A port nobody listens on right now.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("failed to reserve a port")
}

/// Shell command that records its own PID in `record` and then sleeps.
pub fn recording_sleeper(record: &Path) -> String {
    format!(
        "[\"sh\", \"-c\", \"echo $$ > {}; exec sleep 30\"]",
        record.display()
    )
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Waits until `path` holds a PID and returns it.
pub fn wait_for_pid(path: &Path) -> Pid {
    let mut found = None;
    let ready = wait_until(WAIT_TIMEOUT, || {
        found = fs::read_to_string(path)
            .ok()
            .and_then(|content| content.trim().parse::<i32>().ok())
            .filter(|pid| *pid > 0);
        found.is_some()
    });
    match (ready, found) {
        (true, Some(pid)) => Pid::from_raw(pid),
        _ => panic!("Timed out waiting for a PID in {:?}", path),
    }
}

/// Waits until `path` holds a PID different from `previous`.
pub fn wait_for_new_pid(path: &Path, previous: Pid) -> Pid {
    let mut latest = previous;
    let changed = wait_until(WAIT_TIMEOUT, || {
        latest = wait_for_pid(path);
        latest != previous
    });
    assert!(changed, "PID in {:?} never changed from {previous}", path);
    latest
}

pub fn is_process_alive(pid: Pid) -> bool {
    hydre::process::probe(pid)
}

pub fn wait_for_exit_of(pid: Pid) {
    assert!(
        wait_until(WAIT_TIMEOUT, || !is_process_alive(pid)),
        "process {pid} is still alive"
    );
}

pub fn wait_for_listener(port: u16) {
    assert!(
        wait_until(WAIT_TIMEOUT, || TcpStream::connect(("127.0.0.1", port)).is_ok()),
        "nothing is listening on port {port}"
    );
}

pub fn hydre_bin() -> &'static Path {
    assert_cmd::cargo::cargo_bin!("hydre")
}

/// A `hydre` process running in the background, terminated on drop.
pub struct Background {
    child: Child,
}

impl Background {
    pub fn spawn(args: &[&str], config: &Path) -> Self {
        let child = Command::new(hydre_bin())
            .args(args)
            .arg("--config")
            .arg(config)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn hydre");
        Self { child }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    /// Sends `sig` to hydre and waits for it to exit.
    pub fn stop_with(&mut self, sig: Signal) -> ExitStatus {
        let _ = signal::kill(self.pid(), sig);
        self.wait()
    }

    pub fn wait(&mut self) -> ExitStatus {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().expect("failed to poll hydre") {
                return status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                panic!("hydre did not exit in time");
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = signal::kill(self.pid(), Signal::SIGTERM);
            let _ = self.child.wait();
        }
    }
}
