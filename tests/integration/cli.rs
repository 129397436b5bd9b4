//! Smoke tests for the `featureloop` binary.

use assert_cmd::Command;
use featureloop::config::config_path;
use featureloop::feature::{Feature, FeatureStore, PlanSpec, PlanStatus};
use featureloop::plan::{ApprovalInbox, Verdict};
use featureloop::state::{ExecutionState, ExecutionStateStore};
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the featureloop binary, pointed at `project`.
#[allow(deprecated)]
fn featureloop_cmd(project: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("featureloop").expect("Failed to find featureloop binary");
    cmd.arg("--project").arg(project.path());
    cmd
}

/// Test that `init` writes a loadable default configuration.
#[test]
fn test_init_writes_default_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    featureloop_cmd(&temp_dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let written = std::fs::read_to_string(config_path(temp_dir.path())).expect("config written");
    assert!(written.contains("max_concurrency = 1"));
    assert!(written.contains("[PLAN_GENERATED]"));

    featureloop_cmd(&temp_dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

/// Test that `status` lists stored features with their status.
#[test]
fn test_status_lists_features() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    featureloop_cmd(&temp_dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No features."));

    let store = FeatureStore::new(temp_dir.path()).expect("store");
    store
        .save(&Feature::new("login-form", "Add login form"))
        .expect("save feature");

    featureloop_cmd(&temp_dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("login-form"))
        .stdout(predicate::str::contains("backlog"))
        .stdout(predicate::str::contains("Add login form"));
}

/// Test that `stop` removes the execution-state snapshot.
#[test]
fn test_stop_clears_execution_state() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state_store = ExecutionStateStore::new(temp_dir.path());
    state_store
        .save(&ExecutionState::new(true, 2, vec!["login-form".to_string()]))
        .expect("save snapshot");

    featureloop_cmd(&temp_dir).arg("stop").assert().success();

    assert!(state_store.load().expect("load").is_none());
}

/// Test that `metrics` handles a project with no history.
#[test]
fn test_metrics_without_history() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    featureloop_cmd(&temp_dir)
        .arg("metrics")
        .assert()
        .success()
        .stdout(predicate::str::contains("No metrics recorded yet."));
}

/// Test that starting an unknown feature fails with a clear error.
#[test]
fn test_start_unknown_feature_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    featureloop_cmd(&temp_dir)
        .args(["start", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Feature not found: missing"));
}

/// Test that the concurrency flag rejects non-numbers.
#[test]
fn test_run_rejects_invalid_concurrency() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    featureloop_cmd(&temp_dir)
        .args(["run", "--max-concurrency", "lots"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

/// Test that `approve` and `reject` leave a decision for the waiting run.
#[test]
fn test_approve_and_reject_submit_decisions() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = FeatureStore::new(temp_dir.path()).expect("store");
    let mut plan = PlanSpec::default();
    plan.status = PlanStatus::Generated;
    store
        .save(&Feature::new("search", "Add search").with_plan_spec(plan))
        .expect("save feature");
    let edited = temp_dir.path().join("edited.md");
    std::fs::write(&edited, "- [ ] T001: Add index").expect("write plan");

    featureloop_cmd(&temp_dir)
        .args(["approve", "search", "--feedback", "Keep it small"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Approval recorded for search"));
    let inbox = ApprovalInbox::new(temp_dir.path());
    let decision = inbox.peek("search").expect("peek").expect("decision");
    assert_eq!(decision.verdict, Verdict::Approve);
    assert_eq!(decision.feedback.as_deref(), Some("Keep it small"));

    featureloop_cmd(&temp_dir)
        .args(["reject", "search", "--plan-file"])
        .arg(&edited)
        .assert()
        .success()
        .stdout(predicate::str::contains("Rejection recorded for search"));
    let decision = inbox.peek("search").expect("peek").expect("decision");
    assert_eq!(decision.verdict, Verdict::Reject);
    assert_eq!(decision.edited_plan.as_deref(), Some("- [ ] T001: Add index"));
}

/// Test that `approve` refuses features without a plan under review.
#[test]
fn test_approve_without_waiting_plan_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    FeatureStore::new(temp_dir.path())
        .expect("store")
        .save(&Feature::new("search", "Add search"))
        .expect("save feature");

    featureloop_cmd(&temp_dir)
        .args(["approve", "search"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No pending plan approval for feature search"));
    assert!(ApprovalInbox::new(temp_dir.path())
        .peek("search")
        .expect("peek")
        .is_none());
}
