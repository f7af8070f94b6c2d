//! Integration tests for worker management commands
//!
//! These tests verify that the CLI commands are properly wired up and
//! handle local state without contacting a server.

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A `buildq` command isolated to a scratch state directory
fn buildq(state: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("buildq").unwrap();
    cmd.env("BUILDQ_CONFIG", state.path().join("missing-config.yaml"))
        .env("BUILDQ_STATE_DIR", state.path())
        .env("BUILDQ_API_URL", "http://127.0.0.1:9")
        .env_remove("RUST_LOG");
    cmd
}

/// Test that the main help displays all commands
#[test]
fn test_help_shows_all_commands() {
    let mut cmd = Command::cargo_bin("buildq").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("register"))
        .stdout(predicate::str::contains("deregister"))
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("run"));
}

/// Test run command help
#[test]
fn test_run_help() {
    let mut cmd = Command::cargo_bin("buildq").unwrap();
    cmd.args(["run", "--help"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Run the job loop"))
        .stdout(predicate::str::contains("--push-back"))
        .stdout(predicate::str::contains("--one"))
        .stdout(predicate::str::contains("--show-traceback"))
        .stdout(predicate::str::contains("--clean"))
        .stdout(predicate::str::contains("--no-fetch"))
        .stdout(predicate::str::contains("--timeout"))
        .stdout(predicate::str::contains("--strategy"));
}

/// Test register command help
#[test]
fn test_register_help() {
    let mut cmd = Command::cargo_bin("buildq").unwrap();
    cmd.args(["register", "--help"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("username/queue"))
        .stdout(predicate::str::contains("--platform"))
        .stdout(predicate::str::contains("--hostname"))
        .stdout(predicate::str::contains("--dist"));
}

/// No subcommand is an error
#[test]
fn test_no_command_fails() {
    let state = TempDir::new().unwrap();
    buildq(&state)
        .assert()
        .failure()
        .stdout(predicate::str::contains("No command specified"));
}

/// A malformed queue name is rejected before any network call
#[test]
fn test_register_rejects_bad_queue_name() {
    let state = TempDir::new().unwrap();
    buildq(&state)
        .args(["register", "not-a-queue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid queue name"));
}

/// Test list with no registered workers
#[test]
fn test_list_empty() {
    let state = TempDir::new().unwrap();
    buildq(&state)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No workers registered"));
}

/// Test list shows identities found on disk
#[test]
fn test_list_shows_registered_workers() {
    let state = TempDir::new().unwrap();
    let workers = state.path().join("workers");
    std::fs::create_dir_all(&workers).unwrap();
    std::fs::write(
        workers.join("abc123.yaml"),
        "worker_id: abc123\nusername: alice\nqueue: default\nplatform: linux-64\nhostname: builder\ndist: ubuntu-22.04\nrunning: false\n",
    )
    .unwrap();

    buildq(&state)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("abc123"))
        .stdout(predicate::str::contains("alice/default"))
        .stdout(predicate::str::contains("idle"));
}

/// Running an unknown worker fails with a clear message
#[test]
fn test_run_unknown_worker_fails() {
    let state = TempDir::new().unwrap();
    buildq(&state)
        .args(["run", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown worker 'nope'"));
}

/// Invalid strategy names are rejected by argument parsing
#[test]
fn test_run_rejects_unknown_strategy() {
    let state = TempDir::new().unwrap();
    buildq(&state)
        .args(["run", "w1", "--strategy", "chroot"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("chroot"));
}
