//! Integration tests for the `sandbox-forge` binary.
//!
//! These run the built binary and check its exit status and diagnostics;
//! no network access is needed.

use std::process::Command;

use tempfile::TempDir;

fn sandbox_forge() -> Command {
    Command::new(env!("CARGO_BIN_EXE_sandbox-forge"))
}

#[test]
fn test_invalid_reference_exits_nonzero() {
    let tmp = TempDir::new().unwrap();
    let layouts = tmp.path().join("layouts");
    std::fs::create_dir(&layouts).unwrap();

    let output = sandbox_forge()
        .env("SANDBOX_FORGE_TMPDIR", &layouts)
        .env_remove("RUST_LOG")
        .args(["not-a-uri"])
        .arg(tmp.path().join("sandbox"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("Error: invalid image reference 'not-a-uri'"),
        "stderr: {stderr}"
    );
    assert_eq!(std::fs::read_dir(&layouts).unwrap().count(), 0);
}

#[test]
fn test_missing_arguments_is_usage_error() {
    let output = sandbox_forge().arg("docker://alpine").output().unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("<SANDBOX>"), "stderr: {stderr}");
}

#[test]
fn test_long_help_lists_transports() {
    let output = sandbox_forge().arg("--help").output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Supported transports:"));
    assert!(stdout.contains("  docker"));
    assert!(stdout.contains("  oci"));
}

#[test]
fn test_fetch_failure_is_reported() {
    let tmp = TempDir::new().unwrap();

    let output = sandbox_forge()
        .env("SANDBOX_FORGE_TMPDIR", tmp.path())
        .arg("-q")
        .arg(format!("oci:{}:latest", tmp.path().join("no-layout").display()))
        .arg(tmp.path().join("sandbox"))
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error: fetch failed"), "stderr: {stderr}");
}
