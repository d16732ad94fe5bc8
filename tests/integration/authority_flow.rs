//! Integration tests for the authorization gate and the file-backed ledger
//!
//! The CLI tests run the buildwarden binary against a ledger directory in a
//! temp dir; the library tests drive the orchestrator and engine directly.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

use buildwarden::authority::{
    AuthorityConfig, AuthorityEngine, AuthorizationRequest, DecisionQuery, DecisionType, MemoryHashChain, Role,
};
use buildwarden::config::EngineConfig;
use buildwarden::ledger::{AuthorityLedger, BuildStatus, LedgerConfig, LedgerEventType};
use buildwarden::orchestrator::{BuildOrchestrator, BuildOutcome};
use buildwarden::parallel::{AgentNode, DryRunExecutor, ExecutorConfig};
use buildwarden::resilience::RetryPolicy;

const TEST_PLAN: &str = r#"[
    { "id": "fetch",   "config": { "simulate": { "duration_ms": 5 } } },
    { "id": "compile", "depends_on": ["fetch"], "config": { "simulate": { "duration_ms": 5 } } }
]"#;

/// Get a Command instance for the buildwarden binary
#[allow(deprecated)]
fn buildwarden_cmd() -> Command {
    Command::cargo_bin("buildwarden").expect("Failed to find buildwarden binary")
}

fn run_plan(temp_dir: &TempDir, build_id: &str, role: &str) -> std::process::Output {
    let plan_path = temp_dir.path().join("plan.json");
    fs::write(&plan_path, TEST_PLAN).expect("Failed to write test plan");

    buildwarden_cmd()
        .arg("run")
        .arg(&plan_path)
        .arg("--ledger-dir")
        .arg(temp_dir.path())
        .args(["--build-id", build_id, "--actor", "ci", "--role", role])
        .env_remove("BUILDWARDEN_LEDGER_DIR")
        .timeout(Duration::from_secs(10))
        .output()
        .expect("run")
}

fn ledger_event_types(dir: &Path, build_id: &str) -> Vec<String> {
    let raw = fs::read_to_string(dir.join("ledger").join(format!("{build_id}.jsonl"))).expect("ledger file");
    raw.lines()
        .map(|line| {
            let entry: Value = serde_json::from_str(line).expect("ledger line");
            entry["event_type"].as_str().expect("event type").to_string()
        })
        .collect()
}

fn fast_orchestrator(ledger: AuthorityLedger) -> BuildOrchestrator {
    let authority = AuthorityEngine::new(Arc::new(ledger), AuthorityConfig::default())
        .with_chain(Arc::new(MemoryHashChain::new()));
    let mut config = EngineConfig::default();
    config.executor = ExecutorConfig::new()
        .with_max_concurrency(2)
        .with_retry(RetryPolicy::new().with_max_retries(1).with_base_delay(Duration::from_millis(1)));
    BuildOrchestrator::new(config, Arc::new(authority), Arc::new(DryRunExecutor::new()))
}

// ============================================================================
// CLI: authorization gate
// ============================================================================

/// An observer may not start builds; the denial is ledgered and nothing runs.
#[test]
fn test_cli_denied_start_is_ledgered() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let output = run_plan(&temp_dir, "denied-build", "observer");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Role 'observer' is not permitted to perform build_start"));
    assert!(stderr.contains("remedy"));

    let events = ledger_event_types(temp_dir.path(), "denied-build");
    assert_eq!(events[0], "authorization_denied");
    assert!(!events.iter().any(|e| e == "build_started" || e == "agent_started"));
}

#[test]
fn test_cli_rejects_unknown_role() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let output = run_plan(&temp_dir, "b", "superuser");

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown role"));
}

/// A granted run writes the grant before `build_started` and ends completed.
#[test]
fn test_cli_run_then_show_and_verify_ledger() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    assert!(run_plan(&temp_dir, "release-1", "owner").status.success());

    let events = ledger_event_types(temp_dir.path(), "release-1");
    assert_eq!(events[0], "authorization_granted");
    assert_eq!(events[1], "build_started");
    assert_eq!(events.last().map(String::as_str), Some("build_completed"));

    let output = buildwarden_cmd()
        .args(["ledger", "show", "release-1", "--ledger-dir"])
        .arg(temp_dir.path())
        .output()
        .expect("show");
    assert!(output.status.success());
    let export: Value = serde_json::from_slice(&output.stdout).expect("export json");
    assert_eq!(export["status"], "completed");
    assert_eq!(export["integrity"]["gaps"], json!([]));

    buildwarden_cmd()
        .args(["ledger", "verify", "release-1", "--ledger-dir"])
        .arg(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("contiguous"));

    buildwarden_cmd()
        .args(["ledger", "list", "--ledger-dir"])
        .arg(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("release-1"));
}

#[test]
fn test_cli_ledger_show_since_filters_entries() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    assert!(run_plan(&temp_dir, "b2", "operator").status.success());

    let output = buildwarden_cmd()
        .args(["ledger", "show", "b2", "--since", "2", "--ledger-dir"])
        .arg(temp_dir.path())
        .output()
        .expect("show");

    let entries: Vec<Value> = serde_json::from_slice(&output.stdout).expect("entries json");
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|e| e["sequence"].as_u64().expect("sequence") > 2));
}

/// A hand-edited ledger with a missing sequence fails verification.
#[test]
fn test_cli_ledger_verify_detects_gap() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let ledger_dir = temp_dir.path().join("ledger");
    fs::create_dir_all(&ledger_dir).expect("ledger dir");

    let lines: Vec<String> = [1u64, 3]
        .iter()
        .map(|seq| {
            json!({
                "id": format!("01J0000000000000000000000{seq}"),
                "build_id": "tampered",
                "event_type": "cost_updated",
                "actor_id": null,
                "details": {},
                "timestamp": "2026-01-01T00:00:00Z",
                "sequence": seq,
            })
            .to_string()
        })
        .collect();
    fs::write(ledger_dir.join("tampered.jsonl"), lines.join("\n") + "\n").expect("write ledger");

    buildwarden_cmd()
        .args(["ledger", "verify", "tampered", "--ledger-dir"])
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("expected 2 found 3"));
}

#[test]
fn test_cli_ledger_requires_directory() {
    buildwarden_cmd()
        .args(["ledger", "verify", "anything"])
        .env_remove("BUILDWARDEN_LEDGER_DIR")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no ledger directory"));
}

// ============================================================================
// Library: orchestrated flows
// ============================================================================

/// Sequence numbers stay contiguous when a new process reopens the ledger.
#[tokio::test]
async fn test_file_ledger_sequences_survive_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config = LedgerConfig::new(temp_dir.path());
    let nodes: Vec<AgentNode> = serde_json::from_str(TEST_PLAN).expect("plan");

    let first = fast_orchestrator(AuthorityLedger::from_config(&config).expect("ledger"));
    let outcome = first.run_build("b", nodes.clone(), "ci", Role::Owner).await.expect("run");
    assert!(outcome.succeeded());
    let written = first.ledger().latest_sequence("b").expect("sequence");

    let second = fast_orchestrator(AuthorityLedger::from_config(&config).expect("ledger"));
    let outcome = second.run_build("b", nodes, "ci", Role::Owner).await.expect("rerun");
    assert!(outcome.succeeded());

    let report = second.ledger().verify_integrity("b").expect("verify");
    assert!(report.is_valid());
    assert!(report.latest_sequence > written);
    assert_eq!(report.entries as u64, report.latest_sequence);
}

/// Pause and resume are gated; a reviewer may not pause.
#[tokio::test]
async fn test_pause_and_resume_are_gated() {
    let orchestrator = Arc::new(fast_orchestrator(AuthorityLedger::in_memory()));
    let nodes = vec![
        AgentNode::new("first").with_config(json!({ "simulate": { "duration_ms": 50 } })),
        AgentNode::new("second")
            .depends_on(["first"])
            .with_config(json!({ "simulate": { "duration_ms": 5 } })),
    ];

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run_build("b", nodes, "ci", Role::Owner).await })
    };
    while !orchestrator.is_running("b") {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let denied = orchestrator
        .pause_build("b", "rita", Role::Reviewer, "looks off")
        .await
        .expect("pause request");
    assert!(!denied.is_granted());

    let paused = orchestrator
        .pause_build("b", "ops", Role::Operator, "maintenance window")
        .await
        .expect("pause request");
    assert!(paused.is_granted());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!runner.is_finished());

    let resumed = orchestrator
        .resume_build("b", "ops", Role::Operator)
        .await
        .expect("resume request");
    assert!(resumed.is_granted());

    let outcome = runner.await.expect("join").expect("run");
    assert!(matches!(outcome, BuildOutcome::Completed(_)));

    let types: Vec<LedgerEventType> = orchestrator
        .ledger()
        .read_build_ledger("b")
        .expect("read")
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    let paused_at = types.iter().position(|t| *t == LedgerEventType::BuildPaused).expect("paused");
    let resumed_at = types.iter().position(|t| *t == LedgerEventType::BuildResumed).expect("resumed");
    assert!(paused_at < resumed_at);
    assert_eq!(
        orchestrator.ledger().export_build("b").expect("export").status,
        BuildStatus::Completed
    );
    assert_eq!(orchestrator.authority().trust("b").expect("trust").score(), 95);
}

/// Denials, trust decay and restoration end to end through the engine.
#[tokio::test]
async fn test_trust_decays_and_restores_with_verified_chain() {
    let ledger = Arc::new(AuthorityLedger::in_memory());
    let engine = AuthorityEngine::new(Arc::clone(&ledger), AuthorityConfig::default())
        .with_chain(Arc::new(MemoryHashChain::new()));
    engine.open_build("b");

    for _ in 0..4 {
        let outcome = engine
            .request_authorization(AuthorizationRequest::new("b", "cost_override", "eve", Role::Operator))
            .await
            .expect("outcome");
        assert!(!outcome.is_granted());
    }
    assert_eq!(engine.trust("b").expect("trust").score(), 80);

    let granted = engine
        .request_authorization(AuthorizationRequest::new("b", "gate_approve", "rev", Role::Reviewer))
        .await
        .expect("outcome");
    assert!(granted.is_granted());

    let restored = engine.restore_trust("b", "audit passed").await.expect("restore");
    assert_eq!(restored.score(), 100);

    let denials = engine
        .query_decisions("b", &DecisionQuery::new().of_type(DecisionType::Authorization).by_actor("eve"))
        .expect("query");
    assert_eq!(denials.len(), 4);
    assert!(denials.iter().all(|d| d.decision == "denied"));

    let report = ledger.verify_integrity("b").expect("verify");
    assert!(report.is_valid());
    // 4 denials + 4 trust changes + 1 grant + 1 restoration
    assert_eq!(report.entries, 10);
}
