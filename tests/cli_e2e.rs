//! End-to-end tests for the CLI binary surface.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cloudpull() -> Command {
    Command::cargo_bin("cloudpull").expect("binary builds")
}

#[test]
fn test_help_lists_subcommands() {
    cloudpull()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("sessions"));
}

#[test]
fn test_sessions_on_fresh_state_reports_none() {
    let data_dir = TempDir::new().unwrap();

    cloudpull()
        .arg("--data-dir")
        .arg(data_dir.path())
        .arg("sessions")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions."));
}

#[test]
fn test_sync_without_token_fails_with_hint() {
    let data_dir = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    cloudpull()
        .env_remove("CLOUDPULL_TOKEN")
        .arg("--data-dir")
        .arg(data_dir.path())
        .arg("sync")
        .arg("root123")
        .arg(dest.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("CLOUDPULL_TOKEN"));
}

#[test]
fn test_resume_unknown_session_fails() {
    let data_dir = TempDir::new().unwrap();

    cloudpull()
        .env("CLOUDPULL_TOKEN", "test-token")
        .arg("--data-dir")
        .arg(data_dir.path())
        .arg("resume")
        .arg("999")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_invalid_worker_count_rejected() {
    cloudpull()
        .arg("sync")
        .arg("root123")
        .arg("/tmp/dest")
        .arg("--workers")
        .arg("0")
        .assert()
        .failure();
}
