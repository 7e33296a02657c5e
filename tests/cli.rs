//! Integration tests: run the gopayloader binary and check exit codes and
//! output.

use std::process::Command;

fn gopayloader() -> Command {
    Command::new(env!("CARGO_BIN_EXE_gopayloader"))
}

#[test]
fn test_help() {
    let out = gopayloader().arg("--help").output().unwrap();
    assert!(out.status.success(), "gopayloader --help should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("run"));
    assert!(stdout.contains("clear-cache"));
    assert!(stdout.contains("http-server"));
}

#[test]
fn test_run_help_lists_flags() {
    let out = gopayloader().args(["run", "--help"]).output().unwrap();
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    for flag in [
        "--requests",
        "--connections",
        "--time",
        "--disable-keep-alive",
        "--skip-verify",
        "--client",
        "--jwt-key",
        "--jwt-header",
        "--jwts-filename",
        "--ticker",
    ] {
        assert!(stdout.contains(flag), "missing flag {} in help", flag);
    }
}

#[test]
fn test_run_without_url_fails() {
    let out = gopayloader().arg("run").output().unwrap();
    assert!(!out.status.success(), "run without a url should fail");
}

#[test]
fn test_run_url_without_port_fails() {
    let out = gopayloader()
        .args(["run", "http://localhost/", "-r", "10"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("scheme://host:port/path"),
        "expected format hint, got: {}",
        stderr
    );
}

#[test]
fn test_run_conns_above_reqs_fails() {
    let out = gopayloader()
        .args(["run", "http://localhost:8080/", "-r", "5", "-c", "10"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("connections can't be more than requests"));
}

#[test]
fn test_run_unknown_client_fails() {
    let out = gopayloader()
        .args(["run", "http://localhost:8080/", "-r", "1", "--client", "curl"])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn test_jwt_key_requires_header() {
    let out = gopayloader()
        .args([
            "run",
            "http://localhost:8080/",
            "-r",
            "1",
            "--jwt-key",
            "/tmp/does-not-matter.pem",
        ])
        .output()
        .unwrap();
    assert!(!out.status.success());
}

#[test]
fn test_clear_cache_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let out = gopayloader()
        .env("GOPAYLOADER_CACHE_DIR", dir.path())
        .arg("clear-cache")
        .output()
        .unwrap();
    assert!(out.status.success(), "clear-cache should succeed");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Cache cleared"));
}
