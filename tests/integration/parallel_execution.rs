//! Integration tests for plan resolution and parallel execution
//!
//! These tests drive the buildwarden binary with JSON plan files and the
//! dry-run agent executor.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Three independent agents followed by one that depends on all of them.
const TEST_PLAN_DIAMOND: &str = r#"[
    { "id": "lint",    "phase_id": "check", "estimated_duration_ms": 20, "estimated_cost": 1.0,
      "config": { "simulate": { "duration_ms": 20, "cost": 1.0 } } },
    { "id": "compile", "phase_id": "build", "estimated_duration_ms": 50, "estimated_cost": 2.0,
      "config": { "simulate": { "duration_ms": 50, "cost": 2.0 } } },
    { "id": "docs",    "phase_id": "build", "estimated_duration_ms": 10, "estimated_cost": 0.5,
      "config": { "simulate": { "duration_ms": 10, "cost": 0.5 } } },
    { "id": "package", "phase_id": "ship", "depends_on": ["lint", "compile", "docs"],
      "estimated_duration_ms": 10, "estimated_cost": 1.0,
      "config": { "simulate": { "duration_ms": 10, "cost": 1.0 } } }
]"#;

/// One agent that fails every attempt with a non-transient error.
const TEST_PLAN_FAILING: &str = r#"[
    { "id": "compile", "config": { "simulate": { "duration_ms": 5 } } },
    { "id": "test", "depends_on": ["compile"],
      "config": { "simulate": { "fail_always": true, "error": "assertion failed: left == right" } } }
]"#;

const TEST_PLAN_CYCLE: &str = r#"[
    { "id": "a", "depends_on": ["b"] },
    { "id": "b", "depends_on": ["a"] }
]"#;

/// Get a Command instance for the buildwarden binary
#[allow(deprecated)]
fn buildwarden_cmd() -> Command {
    Command::cargo_bin("buildwarden").expect("Failed to find buildwarden binary")
}

fn write_plan(temp_dir: &TempDir, contents: &str) -> PathBuf {
    let plan_path = temp_dir.path().join("plan.json");
    fs::write(&plan_path, contents).expect("Failed to write test plan");
    plan_path
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

// ============================================================================
// plan
// ============================================================================

/// The plan command prints waves, critical path and estimates.
#[test]
fn test_plan_prints_groups_and_critical_path() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan_path = write_plan(&temp_dir, TEST_PLAN_DIAMOND);

    let output = buildwarden_cmd()
        .arg("plan")
        .arg(&plan_path)
        .output()
        .expect("run plan");

    assert!(output.status.success());
    let plan = stdout_json(&output);
    let groups = plan["parallel_groups"].as_array().expect("groups");
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["agents"].as_array().expect("ids").len(), 3);
    assert_eq!(plan["critical_path"], serde_json::json!(["compile", "package"]));
    assert_eq!(plan["critical_path_duration_ms"], 60);
    assert_eq!(plan["estimated_total_cost"], 4.5);
}

/// Cycles are rejected with the offending agents named.
#[test]
fn test_plan_rejects_cycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan_path = write_plan(&temp_dir, TEST_PLAN_CYCLE);

    buildwarden_cmd()
        .arg("plan")
        .arg(&plan_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"))
        .stderr(predicate::str::contains("a"));
}

#[test]
fn test_plan_missing_file_fails() {
    buildwarden_cmd()
        .args(["plan", "does-not-exist.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("reading plan"));
}

// ============================================================================
// run
// ============================================================================

/// A passing plan completes and reports every task.
#[test]
fn test_run_completes_diamond_plan() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan_path = write_plan(&temp_dir, TEST_PLAN_DIAMOND);

    let output = buildwarden_cmd()
        .arg("run")
        .arg(&plan_path)
        .args(["--max-concurrency", "3", "--build-id", "diamond"])
        .timeout(std::time::Duration::from_secs(10))
        .output()
        .expect("run");

    assert!(output.status.success());
    let outcome = stdout_json(&output);
    assert_eq!(outcome["outcome"], "completed");
    assert_eq!(outcome["report"]["results"].as_array().expect("results").len(), 4);
    assert_eq!(outcome["report"]["stats"]["succeeded"], 4);
    assert!(outcome["report"]["stats"]["peak_concurrency"].as_u64().expect("peak") <= 3);
    assert_eq!(outcome["trust"]["score"], 100);
}

/// max_concurrency of 1 runs sequentially and still succeeds.
#[test]
fn test_run_with_concurrency_one() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan_path = write_plan(&temp_dir, TEST_PLAN_DIAMOND);

    let output = buildwarden_cmd()
        .arg("run")
        .arg(&plan_path)
        .args(["--max-concurrency", "1"])
        .timeout(std::time::Duration::from_secs(10))
        .output()
        .expect("run");

    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["report"]["stats"]["peak_concurrency"], 1);
}

#[test]
fn test_run_rejects_zero_concurrency() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan_path = write_plan(&temp_dir, TEST_PLAN_DIAMOND);

    buildwarden_cmd()
        .arg("run")
        .arg(&plan_path)
        .args(["--max-concurrency", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--max-concurrency"));
}

/// A terminally failing task fails the run and the process.
#[test]
fn test_run_with_failing_task_exits_with_error() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan_path = write_plan(&temp_dir, TEST_PLAN_FAILING);

    let output = buildwarden_cmd()
        .arg("run")
        .arg(&plan_path)
        .args(["--max-retries", "0"])
        .timeout(std::time::Duration::from_secs(15))
        .output()
        .expect("run");

    assert!(!output.status.success());
    let outcome = stdout_json(&output);
    assert_eq!(outcome["outcome"], "failed");
    let failed = outcome["report"]["results"]
        .as_array()
        .expect("results")
        .iter()
        .find(|r| r["task_id"] == "test")
        .cloned()
        .expect("test result");
    assert_eq!(failed["success"], false);
    assert!(failed["error"]["message"]
        .as_str()
        .expect("message")
        .contains("assertion failed"));
    assert_eq!(outcome["trust"]["score"], 90);
}

/// The run help lists the tuning flags.
#[test]
fn test_run_command_help_shows_options() {
    buildwarden_cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-concurrency"))
        .stdout(predicate::str::contains("--circuit-breaker-threshold"))
        .stdout(predicate::str::contains("--ledger-dir"));
}

/// Environment overrides reach the executor configuration.
#[test]
fn test_config_command_applies_env_overrides() {
    buildwarden_cmd()
        .arg("config")
        .env("BUILDWARDEN__EXECUTOR__MAX_CONCURRENCY", "7")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_concurrency = 7"));
}
