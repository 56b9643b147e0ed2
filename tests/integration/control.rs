#[path = "common/mod.rs"]
mod common;

use std::path::Path;

use assert_cmd::Command;
use common::{
    Background, free_port, hydre_bin, is_process_alive, recording_sleeper, wait_for_exit_of,
    wait_for_listener, wait_for_new_pid, wait_for_pid, write_config,
};
use nix::sys::signal::{self, Signal};
use predicates::prelude::*;
use tempfile::tempdir;

fn control(action: &str, daemon: &str, config: &Path) -> assert_cmd::assert::Assert {
    Command::new(hydre_bin())
        .arg(action)
        .arg(daemon)
        .arg("--config")
        .arg(config)
        .assert()
}

fn supervised_config(dir: &Path, port: u16) -> std::path::PathBuf {
    write_config(
        dir,
        &format!(
            r#"timeout: 2
interval: 1
port: "{port}"
daemons:
  daemon-1:
    command: {}
  daemon-2:
    command: {}
    stopCommand: ["sh", "-c", "kill $(cat {}); echo daemon-2 stopped"]
"#,
            recording_sleeper(&dir.join("daemon-1.current")),
            recording_sleeper(&dir.join("daemon-2.current")),
            dir.join("daemon-2.current").display(),
        ),
    )
}

#[test]
fn stop_and_start_toggle_a_daemon() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let port = free_port();
    let config = supervised_config(dir, port);

    let _hydre = Background::spawn(&["supervise"], &config);
    wait_for_listener(port);
    let first = wait_for_pid(&dir.join("daemon-2.current"));
    let other = wait_for_pid(&dir.join("daemon-1.current"));

    control("stop", "daemon-2", &config)
        .success()
        .stdout(predicate::str::contains("daemon-2 stopped"));
    wait_for_exit_of(first);

    // Disabled daemons stay down across ticks.
    std::thread::sleep(std::time::Duration::from_millis(2500));
    assert!(!is_process_alive(wait_for_pid(&dir.join("daemon-2.current"))));
    assert!(is_process_alive(other));

    control("start", "daemon-2", &config).success();
    let second = wait_for_new_pid(&dir.join("daemon-2.current"), first);
    assert!(is_process_alive(second));
    assert!(is_process_alive(other));
}

#[test]
fn unknown_daemon_is_reported_to_the_caller() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let port = free_port();
    let config = supervised_config(dir, port);

    let _hydre = Background::spawn(&["supervise"], &config);
    wait_for_listener(port);
    let pid = wait_for_pid(&dir.join("daemon-1.current"));

    control("stop", "daemon-9", &config)
        .success()
        .stdout(predicate::str::contains("could not find daemon `daemon-9`"));

    assert!(is_process_alive(pid));
}

#[test]
fn killed_daemon_is_restarted() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let port = free_port();
    let config = supervised_config(dir, port);

    let _hydre = Background::spawn(&["supervise"], &config);
    let record = dir.join("daemon-1.current");
    let first = wait_for_pid(&record);

    signal::kill(first, Signal::SIGKILL).expect("failed to kill daemon");

    let second = wait_for_new_pid(&record, first);
    assert!(is_process_alive(second));
}

#[test]
fn termination_stops_every_daemon() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let port = free_port();
    let config = supervised_config(dir, port);

    let mut hydre = Background::spawn(&["supervise"], &config);
    wait_for_listener(port);
    let first = wait_for_pid(&dir.join("daemon-1.current"));
    let second = wait_for_pid(&dir.join("daemon-2.current"));

    let status = hydre.stop_with(Signal::SIGTERM);

    assert_eq!(status.code(), Some(0));
    wait_for_exit_of(first);
    wait_for_exit_of(second);
}
