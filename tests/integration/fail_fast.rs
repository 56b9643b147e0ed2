#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use common::{
    Background, hydre_bin, is_process_alive, recording_sleeper, wait_for_exit_of,
    wait_for_pid, write_config,
};
use nix::sys::signal::{self, Signal};
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn failing_daemon_stops_the_whole_group() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let record = dir.join("web.current");

    let config = write_config(
        dir,
        &format!(
            r#"timeout: 2
daemons:
  web:
    command: {}
  crasher:
    command: ["sh", "-c", "sleep 1; exit 3"]
"#,
            recording_sleeper(&record)
        ),
    );

    let started = Instant::now();
    Command::new(hydre_bin())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .timeout(Duration::from_secs(20))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("daemon `crasher` has stopped"));

    assert!(started.elapsed() < Duration::from_secs(10));
    let web = wait_for_pid(&record);
    wait_for_exit_of(web);
}

#[test]
fn termination_signal_stops_the_group_cleanly() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let record = dir.join("web.current");

    let config = write_config(
        dir,
        &format!(
            "timeout: 2\ndaemons:\n  web:\n    command: {}\n",
            recording_sleeper(&record)
        ),
    );

    let mut hydre = Background::spawn(&["run"], &config);
    let web = wait_for_pid(&record);
    assert!(is_process_alive(web));

    let status = hydre.stop_with(Signal::SIGTERM);

    assert_eq!(status.code(), Some(0));
    wait_for_exit_of(web);
}

#[test]
fn log_lines_are_streamed_to_stdout() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let log = dir.join("app.log");
    fs::write(&log, "").expect("failed to create log");

    let config = write_config(
        dir,
        r#"timeout: 1
daemons:
  writer:
    command: ["sh", "-c", "echo hello-from-log >> app.log; sleep 1"]
    logFiles: [app.log]
"#,
    );

    Command::new(hydre_bin())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .current_dir(dir)
        .timeout(Duration::from_secs(20))
        .assert()
        .code(1)
        .stdout(predicate::str::contains("hello-from-log"));
}

#[test]
fn missing_log_file_is_a_fault() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();

    let config = write_config(
        dir,
        r#"timeout: 1
daemons:
  quiet:
    command: ["sleep", "30"]
    logFiles: [nowhere.log]
"#,
    );

    Command::new(hydre_bin())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .timeout(Duration::from_secs(20))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("could not stream logs from"));
}

#[test]
fn adopted_daemon_death_is_detected() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let pid_file = dir.join("bg.pid");

    let config = write_config(
        dir,
        &format!(
            r#"timeout: 1
daemons:
  background:
    command: ["sh", "-c", "sleep 30 > /dev/null 2>&1 & echo $! > {}"]
    pidFile: {}
"#,
            pid_file.display(),
            pid_file.display()
        ),
    );

    let mut hydre = Background::spawn(&["run"], &config);
    let adopted = wait_for_pid(&pid_file);
    assert!(is_process_alive(adopted));

    signal::kill(adopted, Signal::SIGKILL).expect("failed to kill adopted daemon");

    let status = hydre.wait();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn stop_command_is_used_on_shutdown() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let marker = dir.join("stopped");

    let config = write_config(
        dir,
        &format!(
            r#"timeout: 2
daemons:
  polite:
    command: ["sleep", "30"]
    stopCommand: ["touch", "{}"]
  crasher:
    command: ["false"]
"#,
            marker.display()
        ),
    );

    Command::new(hydre_bin())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .timeout(Duration::from_secs(20))
        .assert()
        .code(1);

    assert!(marker.exists());
}

#[test]
fn disabled_daemon_is_not_run() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let marker = dir.join("ran");

    let config = write_config(
        dir,
        &format!(
            r#"timeout: 1
daemons:
  parked:
    command: ["touch", "{}"]
    enabled: false
  crasher:
    command: ["sh", "-c", "sleep 1; exit 3"]
"#,
            marker.display()
        ),
    );

    Command::new(hydre_bin())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .timeout(Duration::from_secs(20))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("daemon `crasher` has stopped"));

    assert!(!marker.exists());
}
