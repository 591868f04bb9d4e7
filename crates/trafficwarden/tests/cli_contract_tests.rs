//! CLI command contract tests
//!
//! Runs the `tw` binary against temp config files and checks exit codes,
//! JSON shape and error messages.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Write `contents` as `tw.toml` in a fresh temp dir.
fn config_file(contents: &str) -> (TempDir, String) {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("tw.toml");
    std::fs::write(&path, contents).expect("write config");
    let path = path.to_string_lossy().to_string();
    (dir, path)
}

#[allow(deprecated)]
fn tw() -> Command {
    let mut cmd = Command::cargo_bin("tw").expect("tw binary should be built");
    cmd.env_remove("TW_CONFIG")
        .env_remove("TW_REMOTE_URL")
        .env_remove("TW_REMOTE_TOKEN")
        .env_remove("TW_LOG_LEVEL");
    cmd
}

// =============================================================================
// tw config
// =============================================================================

#[test]
fn contract_config_validate_defaults() {
    tw().args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config ok"))
        .stdout(predicate::str::contains("remote=in-process"))
        .stdout(predicate::str::contains("alert rules=3"));
}

#[test]
fn contract_config_validate_rejects_zero_capacity() {
    let (_dir, path) = config_file("[log_sink]\ncapacity = 0\n");
    tw().args(["--config", &path, "config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("log_sink.capacity"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn contract_config_validate_rejects_unknown_metric() {
    let (_dir, path) = config_file(
        r#"
[[alerts.rules]]
id = "disk"
name = "Disk pressure"
metric = "disk_io"
condition = "greater_than"
threshold = 90.0
severity = "high"
"#,
    );
    tw().args(["--config", &path, "config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disk_io"));
}

#[test]
fn contract_config_missing_file_is_actionable() {
    tw().args(["--config", "/nonexistent/tw.toml", "config", "validate"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/tw.toml"));
}

#[test]
fn contract_config_show_redacts_token() {
    let (_dir, path) = config_file(
        "[remote]\nurl = \"https://kv.example.com\"\ntoken = \"super-secret-token\"\n",
    );
    let output = tw()
        .args(["--config", &path, "config", "show", "--format", "json"])
        .output()
        .expect("tw config show should execute");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("super-secret-token"), "token leaked: {stdout}");
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(value["remote"]["token"], "[REDACTED]");
    assert_eq!(value["remote"]["url"], "https://kv.example.com");
    assert_eq!(value["rate_limits"]["api"]["max_requests"], 100);
}

#[test]
fn contract_config_show_toml_round_trips() {
    let (_dir, path) = config_file("[rate_limits.auth]\nmax_requests = 3\nwindow_secs = 120\n");
    let output = tw()
        .args(["--config", &path, "config", "show"])
        .output()
        .expect("tw config show should execute");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: toml::Value = toml::from_str(&stdout).expect("valid TOML");
    assert_eq!(parsed["rate_limits"]["auth"]["max_requests"].as_integer(), Some(3));
}

// =============================================================================
// tw rules
// =============================================================================

#[test]
fn contract_rules_lists_starter_set() {
    let output = tw().arg("rules").output().expect("tw rules should execute");
    assert!(output.status.success());
    let rules: Vec<serde_json::Value> =
        serde_json::from_slice(&output.stdout).expect("rules should be a JSON array");
    let ids: Vec<&str> = rules.iter().filter_map(|r| r["id"].as_str()).collect();
    assert_eq!(
        ids,
        vec!["high_error_rate", "slow_response_time", "high_memory_usage"]
    );
}

// =============================================================================
// tw simulate
// =============================================================================

#[test]
fn contract_simulate_denies_after_limit() {
    let output = tw()
        .args([
            "simulate", "--class", "api", "-n", "4", "--max", "3", "--window", "60", "--format",
            "json",
        ])
        .output()
        .expect("tw simulate should execute");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let decisions: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("one JSON object per line"))
        .collect();
    assert_eq!(decisions.len(), 4);
    let remaining: Vec<u64> = decisions
        .iter()
        .map(|d| d["remaining"].as_u64().unwrap())
        .collect();
    assert_eq!(remaining, vec![2, 1, 0, 0]);
    assert_eq!(decisions[2]["allowed"], true);
    assert_eq!(decisions[3]["allowed"], false);
    assert!(decisions[3]["retry_after_secs"].as_u64().unwrap() > 0);
    assert!(decisions[0].get("retry_after_secs").is_none());
}

#[test]
fn contract_simulate_plain_has_no_ansi() {
    let output = tw()
        .args(["simulate", "--class", "auth", "-n", "2", "--max", "1"])
        .output()
        .expect("tw simulate should execute");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("\x1b["));
    assert!(stdout.contains("allowed"));
    assert!(stdout.contains("denied"));
}

#[test]
fn contract_simulate_rejects_unknown_class() {
    tw().args(["simulate", "--class", "bulk"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown limit class"));
}

#[test]
fn contract_simulate_rejects_empty_identifier() {
    tw().args(["simulate", "--identifier", " ", "-n", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("identifier"));
}
