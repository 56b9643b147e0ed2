#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::{free_port, hydre_bin, write_config};
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn missing_config_exits_with_config_failure() {
    let temp = tempdir().expect("failed to create tempdir");
    let missing = temp.path().join("absent.yml");

    Command::new(hydre_bin())
        .arg("run")
        .arg("--config")
        .arg(&missing)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn config_path_comes_from_the_environment() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), "daemons:\n  web:\n    command: [\n");

    Command::new(hydre_bin())
        .arg("run")
        .env("HYDRE_CONFIGURATION_FILE", &config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid YAML format"));
}

#[test]
fn unset_variable_in_config_is_rejected() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(
        temp.path(),
        "daemons:\n  web:\n    command: ${HYDRE_CLI_TEST_UNSET_BINARY}\n",
    );

    Command::new(hydre_bin())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .env_remove("HYDRE_CLI_TEST_UNSET_BINARY")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("HYDRE_CLI_TEST_UNSET_BINARY"));
}

#[test]
fn control_commands_need_a_port() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), "daemons:\n  web:\n    command: sleep 30\n");

    Command::new(hydre_bin())
        .args(["stop", "web", "--config"])
        .arg(&config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("port"));
}

#[test]
fn unreachable_supervisor_is_an_error() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(
        temp.path(),
        &format!(
            "port: {}\ndaemons:\n  web:\n    command: sleep 30\n",
            free_port()
        ),
    );

    Command::new(hydre_bin())
        .args(["start", "web", "--quiet", "--config"])
        .arg(&config)
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn empty_group_runs_until_terminated() {
    let temp = tempdir().expect("failed to create tempdir");
    let config = write_config(temp.path(), "timeout: 1\n");

    let mut hydre = common::Background::spawn(&["run"], &config);
    std::thread::sleep(std::time::Duration::from_millis(500));
    let status = hydre.stop_with(nix::sys::signal::Signal::SIGINT);

    assert_eq!(status.code(), Some(0));
}

#[test]
fn help_lists_every_mode() {
    Command::new(hydre_bin())
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("run")
                .and(predicate::str::contains("supervise"))
                .and(predicate::str::contains("start"))
                .and(predicate::str::contains("stop")),
        );
}
