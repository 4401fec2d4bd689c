//! CLI Integration Tests
//!
//! These tests drive the `swarmchat` binary end-to-end. They stay on the
//! loopback network; the iroh-backed `node` command is only checked for
//! argument handling.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

fn cli_cmd() -> Command {
    Command::cargo_bin("swarmchat").expect("Failed to find swarmchat binary")
}

// ============================================================================
// contact-topic
// ============================================================================

#[test]
fn test_contact_topic_is_stable() {
    let first = cli_cmd().args(["contact-topic", KEY]).assert().success();
    let first = String::from_utf8(first.get_output().stdout.clone()).unwrap();

    let second = cli_cmd().args(["contact-topic", KEY]).assert().success();
    let second = String::from_utf8(second.get_output().stdout.clone()).unwrap();

    assert!(first.starts_with("Contact topic: "));
    assert_eq!(first.trim().len(), "Contact topic: ".len() + 64);
    assert_eq!(first, second);
}

#[test]
fn test_contact_topic_depends_on_prefix() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"contact_topic_prefix": "other:"}"#).unwrap();

    let default = cli_cmd().args(["contact-topic", KEY]).assert().success();
    let default = String::from_utf8(default.get_output().stdout.clone()).unwrap();

    let custom = cli_cmd()
        .arg("--config")
        .arg(&path)
        .args(["contact-topic", KEY])
        .assert()
        .success();
    let custom = String::from_utf8(custom.get_output().stdout.clone()).unwrap();

    assert_ne!(default, custom);
}

#[test]
fn test_contact_topic_rejects_bad_key() {
    cli_cmd()
        .args(["contact-topic", "not-hex"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid peer key"));
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"event_channel_capacity": 0}"#).unwrap();

    cli_cmd()
        .arg("--config")
        .arg(&path)
        .args(["contact-topic", KEY])
        .assert()
        .failure()
        .stderr(predicate::str::contains("event_channel_capacity"));
}

// ============================================================================
// decode
// ============================================================================

#[test]
fn test_decode_typing_event() {
    cli_cmd()
        .args([
            "decode",
            r#"{"nonce":"aa01","payload":{"type":"TOPIC_TYPING","payload":{"typing":true}}}"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Kind: TOPIC_TYPING"))
        .stdout(predicate::str::contains("\"typing\": true"));
}

#[test]
fn test_decode_profile_request_without_payload() {
    cli_cmd()
        .args(["decode", r#"{"nonce":"aa02","payload":{"type":"PROFILE_REQUEST"}}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Kind: PROFILE_REQUEST"));
}

#[test]
fn test_decode_unknown_kind() {
    cli_cmd()
        .args(["decode", r#"{"nonce":"aa03","payload":{"type":"FUTURE_THING"}}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("FUTURE_THING (unknown, ignored)"));
}

#[test]
fn test_decode_missing_nonce_fails() {
    cli_cmd()
        .args(["decode", r#"{"payload":{"type":"TOPIC_TYPING","payload":{"typing":true}}}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing nonce"));
}

#[test]
fn test_decode_not_json_fails() {
    cli_cmd()
        .args(["decode", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Malformed message"));
}

// ============================================================================
// demo
// ============================================================================

#[test]
fn test_demo_runs_handshake_and_channel() {
    cli_cmd()
        .arg("demo")
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("Contact handshake: alice -> bob"))
        .stdout(predicate::str::contains("Direct topic: "))
        .stdout(predicate::str::contains("Channel topic: "))
        .stdout(predicate::str::contains("bob Accepted"))
        .stdout(predicate::str::contains("hello bob"))
        .stdout(predicate::str::contains("#planning"))
        .stdout(predicate::str::contains("glad to be here"));
}

#[test]
fn test_demo_writes_jsonl_logs() {
    let dir = TempDir::new().unwrap();

    cli_cmd()
        .arg("-v")
        .arg("--logs-dir")
        .arg(dir.path())
        .arg("demo")
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success();

    let logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    assert!(!logs.is_empty(), "expected a JSONL log file");
}

// ============================================================================
// argument handling
// ============================================================================

#[test]
fn test_node_address_requires_request() {
    cli_cmd()
        .args(["node", "--address", "somewhere"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--request"));
}

#[test]
fn test_help_lists_commands() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("contact-topic"))
        .stdout(predicate::str::contains("decode"))
        .stdout(predicate::str::contains("demo"))
        .stdout(predicate::str::contains("node"));
}
