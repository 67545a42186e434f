//! End-to-end CLI tests for the cache node binary.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_displays_usage() {
    let mut cmd = Command::cargo_bin("cachenode").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cache node"));
}

#[test]
fn version_displays_version() {
    let mut cmd = Command::cargo_bin("cachenode").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("cachenode"));
}

#[test]
fn invalid_flag_returns_error() {
    let mut cmd = Command::cargo_bin("cachenode").unwrap();
    cmd.arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

/// Without `--client-id`/`--client-key` or a config file, startup fails
/// before any network I/O is attempted.
#[test]
fn missing_client_identity_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = Command::cargo_bin("cachenode").unwrap();
    cmd.arg("--dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("client id"));
}

/// A config file missing both fields also fails before any network I/O.
#[test]
fn empty_config_file_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let cfg_path = dir.path().join("cfg.toml");
    std::fs::write(&cfg_path, "").unwrap();

    let mut cmd = Command::cargo_bin("cachenode").unwrap();
    cmd.arg("--dir")
        .arg(dir.path())
        .arg("--cfg")
        .arg(&cfg_path)
        .assert()
        .failure();
}
