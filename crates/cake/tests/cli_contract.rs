//! CLI contract tests: the subcommands other tooling scripts against.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let path = dir.path().join("cake.toml");
    let payload = format!(
        "version = \"1.0\"\ndata_dir = \"{}\"\n",
        dir.path().join("state").display()
    );
    std::fs::write(&path, payload).unwrap();
    path
}

#[test]
fn decide_blocks_force_push_with_alternative() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    Command::cargo_bin("cake")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "decide", "git", "push", "--force"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"allowed\": false"))
        .stdout(predicate::str::contains("--force-with-lease"));
}

#[test]
fn decide_allows_benign_command() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    Command::cargo_bin("cake")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "decide", "ls", "-la"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"allowed\": true"));
}

#[test]
fn decide_writes_audit_entry() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    Command::cargo_bin("cake")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "decide", "ls"])
        .assert()
        .success();

    Command::cargo_bin("cake")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "audit", "-n", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"command\":\"ls\""));
}

#[test]
fn config_check_accepts_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    Command::cargo_bin("cake")
        .unwrap()
        .args(["config", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok:"));
}

#[test]
fn config_check_rejects_bad_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "version = \"1.0\"\n[escalation]\nmax_strikes = 99\n").unwrap();

    Command::cargo_bin("cake")
        .unwrap()
        .args(["config", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_strikes"));
}

#[test]
fn recall_stats_on_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(&dir);

    Command::cargo_bin("cake")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "recall", "stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"active_records\": 0"));
}
