//! End-to-end tests for the notevault binary
//!
//! Every test gets its own data directory and a cheap KDF so the password
//! flow stays fast.

use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn notevault(data_dir: &Path, password: &str, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_notevault"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .env("NOTEVAULT_PASSWORD", password)
        .env("NOTEVAULT_KDF_MEMORY_KIB", "64")
        .env("NOTEVAULT_KDF_ITERATIONS", "1")
        .env("NOTEVAULT_LOG_LEVEL", "warn")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run notevault")
}

fn stdout_json(output: &Output) -> Result<Value> {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(serde_json::from_slice(&output.stdout)?)
}

const KEY: [&str; 8] = [
    "--kind", "main", "--scope", "root", "--id", "data", "--version", "v1",
];

fn with_key<'a>(command: &'a str, extra: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![command];
    args.extend_from_slice(&KEY);
    args.extend_from_slice(extra);
    args
}

#[test]
fn test_put_get_remove_workflow() -> Result<()> {
    let dir = TempDir::new()?;

    let put = notevault(dir.path(), "pw", &with_key("put", &[r#"{"x":1}"#]));
    assert!(put.status.success());

    let got = stdout_json(&notevault(dir.path(), "pw", &with_key("get", &[])))?;
    assert_eq!(got, serde_json::json!({"x": 1}));

    let removed = stdout_json(&notevault(
        dir.path(),
        "pw",
        &["remove", "--kind", "main", "--scope", "root"],
    ))?;
    assert_eq!(removed["removed"], 1);

    let got = stdout_json(&notevault(dir.path(), "pw", &with_key("get", &[])))?;
    assert_eq!(got, serde_json::json!({}));

    let strict = stdout_json(&notevault(dir.path(), "pw", &with_key("get", &["--strict"])))?;
    assert_eq!(strict, Value::Null);
    Ok(())
}

#[test]
fn test_wrong_password_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    assert!(notevault(dir.path(), "right", &with_key("put", &["[1,2]"]))
        .status
        .success());

    let output = notevault(dir.path(), "wrong", &with_key("get", &[]));
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("wrong password"));
    Ok(())
}

#[test]
fn test_change_password() -> Result<()> {
    let dir = TempDir::new()?;
    assert!(notevault(dir.path(), "old", &with_key("put", &[r#""kept""#]))
        .status
        .success());

    let changed = stdout_json(&notevault(
        dir.path(),
        "old",
        &["change-password", "--new-password", "new"],
    ))?;
    assert_eq!(changed["rotated"], 1);

    assert!(!notevault(dir.path(), "old", &with_key("get", &[])).status.success());
    let got = stdout_json(&notevault(dir.path(), "new", &with_key("get", &[])))?;
    assert_eq!(got, Value::String("kept".to_string()));
    Ok(())
}

#[test]
fn test_invalid_document_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let output = notevault(dir.path(), "pw", &with_key("put", &["{not json"]));
    assert!(!output.status.success());
    Ok(())
}

#[test]
fn test_broadcast_to_echo_nodes() -> Result<()> {
    let dir = TempDir::new()?;
    let envelope = stdout_json(&notevault(
        dir.path(),
        "unused",
        &["broadcast", "--nodes", "a,b", "--to", "a,b,ghost", "hello"],
    ))?;

    assert_eq!(envelope["kind"], "broadcast_result");
    assert_eq!(envelope["payload"]["a"]["reply"], "hello");
    assert_eq!(envelope["payload"]["b"]["reply"], "hello");
    assert_eq!(envelope["payload"]["ghost"]["error"]["stage"], "resolve");
    Ok(())
}

#[test]
fn test_init_config_round_trip() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("notevault.toml");

    let output = notevault(dir.path(), "pw", &["init-config", path.to_str().unwrap()]);
    assert!(output.status.success());

    let stats = Command::new(env!("CARGO_BIN_EXE_notevault"))
        .arg("--config")
        .arg(&path)
        .arg("--data-dir")
        .arg(dir.path().join("store"))
        .arg("stats")
        .env("NOTEVAULT_PASSWORD", "pw")
        .env("NOTEVAULT_KDF_MEMORY_KIB", "64")
        .env("NOTEVAULT_KDF_ITERATIONS", "1")
        .output()?;
    let stats = stdout_json(&stats)?;
    assert_eq!(stats["entries"], 0);
    Ok(())
}

#[test]
fn test_invalid_log_level_is_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    let output = notevault(dir.path(), "pw", &["--log-level", "loud", "stats"]);

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("loud"));
    assert!(output.stdout.is_empty());
    Ok(())
}
