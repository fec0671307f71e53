//! CLI tests that never leave the machine (`apply --dry-run`).

use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn rdeploy_bin() -> String {
    env!("CARGO_BIN_EXE_rdeploy").to_string()
}

fn write_plan(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("plan.toml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_apply_dry_run_succeeds() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("app.cfg"), "key = 1").unwrap();
    let plan = write_plan(
        &temp,
        r#"
[[hosts]]
address = "10.0.0.5"

[[hosts]]
address = "10.0.0.6"

[[dirs]]
path = "/srv/app"

[[files]]
local = "app.cfg"
remote = "/srv/app/app.cfg"
owner = "deploy"
"#,
    );

    let output = Command::new(rdeploy_bin())
        .args(["apply", "--dry-run", "--json"])
        .arg(&plan)
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "rdeploy apply failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let hosts = report["hosts"].as_array().unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[0]["host"], "10.0.0.5");

    let steps = hosts[0]["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s["status"] == "ok"));
}

#[test]
fn test_apply_dry_run_missing_local_file_fails() {
    let temp = TempDir::new().unwrap();
    let plan = write_plan(
        &temp,
        r#"
[[hosts]]
address = "10.0.0.5"

[[files]]
local = "does-not-exist.cfg"
remote = "/srv/app.cfg"
"#,
    );

    let output = Command::new(rdeploy_bin())
        .args(["apply", "--dry-run"])
        .arg(&plan)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("does-not-exist.cfg"), "stdout: {}", stdout);
}

#[test]
fn test_apply_invalid_plan_is_an_error() {
    let temp = TempDir::new().unwrap();
    let plan = write_plan(&temp, "hosts = []\n");

    let output = Command::new(rdeploy_bin())
        .args(["apply", "--dry-run"])
        .arg(&plan)
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Plan has no hosts"), "stderr: {}", stderr);
}

#[test]
fn test_single_operation_requires_host() {
    let output = Command::new(rdeploy_bin())
        .args(["size", "/srv/app.cfg"])
        .env_remove("VM_USER")
        .env_remove("VM_PASSWORD")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--host is required"), "stderr: {}", stderr);
}

#[test]
fn test_credentials_are_read_from_dotenv() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join(".env"), "VM_USER=deploy-from-env\n").unwrap();
    let plan = write_plan(
        &temp,
        r#"
[[hosts]]
address = "10.0.0.5"

[[dirs]]
path = "/srv/app"
"#,
    );

    let output = Command::new(rdeploy_bin())
        .args(["apply", "--dry-run", "--json"])
        .arg(&plan)
        .current_dir(temp.path())
        .env_remove("VM_USER")
        .env_remove("VM_PASSWORD")
        .output()
        .unwrap();

    assert!(
        output.status.success(),
        "rdeploy apply failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["hosts"][0]["user"], "deploy-from-env");
}

#[test]
fn test_zero_timeout_is_rejected() {
    let output = Command::new(rdeploy_bin())
        .args(["--timeout", "0", "--host", "127.0.0.1", "size", "/srv/app.cfg"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--timeout"), "stderr: {}", stderr);
}
