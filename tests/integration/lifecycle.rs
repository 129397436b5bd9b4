//! Full feature runs against a scripted agent.

use std::sync::Arc;

use featureloop::config::{GateCommand, PipelineStep};
use featureloop::error::OrchestratorError;
use featureloop::events::OrchestratorEvent;
use featureloop::feature::{Feature, FeatureStatus, PlanStatus, PlanningMode, TaskStatus};
use featureloop::test_support::{lite_plan, Reply, ScriptedAgent};
use tempfile::TempDir;

use crate::common::*;

/// A feature without planning is implemented in one call, then judged.
#[tokio::test]
async fn test_single_call_feature_is_verified() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator
        .store()
        .save(&Feature::new("login", "Add login"))
        .expect("save feature");

    let outcome = orchestrator.execute_feature("login").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert!(outcome.passed);
    assert_eq!(agent.count_matching(IMPLEMENT_PROMPT), 1);
    assert_eq!(agent.count_matching(PLANNING_PROMPT), 0);

    let judge = agent
        .requests()
        .into_iter()
        .find(|request| request.prompt.contains(JUDGE_PROMPT))
        .expect("judge call");
    assert!(judge.read_only);

    let output = orchestrator
        .store()
        .read_agent_output("login")
        .expect("read output")
        .expect("output saved");
    assert!(output.contains("Done."));
    assert!(!output.contains("verdict"), "judge output must not be saved");

    assert!(!orchestrator.is_running("login"));
    assert_eq!(
        orchestrator.store().get("login").expect("load").status,
        FeatureStatus::Verified
    );
}

/// With tests skipped the feature lands in manual review without a judge.
#[tokio::test]
async fn test_skip_tests_waits_for_manual_review() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator
        .store()
        .save(&Feature::new("docs", "Write docs").with_skip_tests(true))
        .expect("save feature");

    let outcome = orchestrator.execute_feature("docs").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::WaitingApproval);
    assert!(outcome.passed);
    assert_eq!(agent.count_matching(JUDGE_PROMPT), 0);
}

/// A gate that fails once is fixed by one fix call.
#[tokio::test]
async fn test_gate_failure_is_fixed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let config = config().with_quality_gates(vec![GateCommand::new(
        "check",
        "test -f .fixed || { touch .fixed; exit 1; }",
    )]);
    let orchestrator = orchestrator(&temp_dir, config, &agent);
    orchestrator
        .store()
        .save(&Feature::new("cache", "Add cache"))
        .expect("save feature");

    let mut events = orchestrator.subscribe();
    let outcome = orchestrator.execute_feature("cache").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(FIX_PROMPT), 1);

    let first = wait_for(&mut events, |event| {
        matches!(event, OrchestratorEvent::QualityMetrics { .. })
    })
    .await;
    assert!(matches!(
        first,
        OrchestratorEvent::QualityMetrics {
            attempt: 1,
            passed: false,
            ..
        }
    ));
    let second = wait_for(&mut events, |event| {
        matches!(event, OrchestratorEvent::QualityMetrics { .. })
    })
    .await;
    assert!(matches!(
        second,
        OrchestratorEvent::QualityMetrics {
            attempt: 2,
            passed: true,
            ..
        }
    ));
}

/// Finished gates are reported with their duration.
#[tokio::test]
async fn test_gate_completion_reports_duration() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let config = config().with_quality_gates(vec![GateCommand::new("lint", "exit 0")]);
    let orchestrator = orchestrator(&temp_dir, config, &agent);
    orchestrator
        .store()
        .save(&Feature::new("cache", "Add cache"))
        .expect("save feature");

    let mut events = orchestrator.subscribe();
    orchestrator.execute_feature("cache").await.expect("run");

    let mut messages = Vec::new();
    wait_for(&mut events, |event| match event {
        OrchestratorEvent::FeatureProgress { message, .. } => {
            messages.push(message.clone());
            message.starts_with("Quality gate lint passed in ")
        }
        _ => false,
    })
    .await;
    assert!(messages.contains(&"Running quality gate: lint".to_string()));
    assert!(messages
        .last()
        .is_some_and(|message| message.ends_with('s')));
}

/// Gates that never pass exhaust the fix attempts and skip the judge.
#[tokio::test]
async fn test_gates_failing_after_fixes_need_manual_review() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let config = config().with_quality_gates(vec![GateCommand::new("lint", "exit 1")]);
    let max_fixes = config.max_quality_fix_attempts as usize;
    let orchestrator = orchestrator(&temp_dir, config, &agent);
    orchestrator
        .store()
        .save(&Feature::new("search", "Add search"))
        .expect("save feature");

    let outcome = orchestrator.execute_feature("search").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::WaitingApproval);
    assert!(!outcome.passed);
    assert_eq!(agent.count_matching(FIX_PROMPT), max_fixes);
    assert_eq!(agent.count_matching(JUDGE_PROMPT), 0);
}

/// A "revise" verdict triggers a revision, and a later pass verifies.
#[tokio::test]
async fn test_judge_revision_then_pass() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(ScriptedAgent::new().on_sequence(
        JUDGE_PROMPT,
        vec![
            Reply::text(r#"{"verdict": "revise", "issues": ["missing error handling"]}"#),
            Reply::text(PASS_VERDICT),
        ],
    ));
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator
        .store()
        .save(&Feature::new("upload", "Add upload"))
        .expect("save feature");

    let outcome = orchestrator.execute_feature("upload").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(JUDGE_PROMPT), 2);
    let revision = agent
        .prompts()
        .into_iter()
        .find(|prompt| prompt.contains("A reviewer asked for changes"))
        .expect("revision call");
    assert!(revision.contains("missing error handling"));
}

/// A planned feature runs every task in dependency order and records
/// progress on the plan.
#[tokio::test]
async fn test_task_plan_runs_every_task() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan = lite_plan(
        "- [ ] T001: Add model | File: src/model.rs | Complexity: low\n\
         - [ ] T002: Add handler | File: src/handler.rs | DependsOn: T001 | Complexity: low\n\
         - [ ] T003: Add docs | Complexity: low",
    );
    let agent = Arc::new(judged_agent().on(PLANNING_PROMPT, Reply::text(plan)));
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator
        .store()
        .save(&Feature::new("api", "Add API").with_planning_mode(PlanningMode::Lite))
        .expect("save feature");

    let outcome = orchestrator.execute_feature("api").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(PLANNING_PROMPT), 1);
    assert_eq!(agent.count_matching(TASK_PROMPT), 3);
    assert_eq!(agent.count_matching(IMPLEMENT_PROMPT), 0);

    let model = request_index(&agent, "## Current task\nT001").expect("T001 ran");
    let handler = request_index(&agent, "## Current task\nT002").expect("T002 ran");
    assert!(model < handler, "T002 must start after T001");

    let plan = orchestrator
        .store()
        .get("api")
        .expect("load")
        .plan_spec
        .expect("plan saved");
    assert_eq!(plan.status, PlanStatus::Approved);
    assert!(!plan.reviewed_by_user);
    assert_eq!(plan.tasks_total, 3);
    assert_eq!(plan.tasks_completed, 3);
    assert!(plan
        .tasks
        .iter()
        .all(|task| task.status == TaskStatus::Completed));
}

/// A failing task blocks the rest and sends the feature back to the backlog.
#[tokio::test]
async fn test_task_failure_returns_feature_to_backlog() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let plan = lite_plan(
        "- [ ] T001: Add model | Complexity: low\n\
         - [ ] T002: Add handler | DependsOn: T001 | Complexity: low",
    );
    let agent = Arc::new(
        judged_agent()
            .on(PLANNING_PROMPT, Reply::text(plan))
            .on("## Current task\nT001", Reply::fail("compile error")),
    );
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator
        .store()
        .save(&Feature::new("api", "Add API").with_planning_mode(PlanningMode::Lite))
        .expect("save feature");

    let err = orchestrator.execute_feature("api").await.unwrap_err();

    assert!(matches!(err, OrchestratorError::TaskFailed { ref task_id, .. } if task_id == "T001"));
    assert_eq!(agent.count_matching("## Current task\nT002"), 0);
    let feature = orchestrator.store().get("api").expect("load");
    assert_eq!(feature.status, FeatureStatus::Backlog);
    assert!(feature.error.is_some());
    let tasks = feature.plan_spec.expect("plan").tasks;
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[1].status, TaskStatus::Blocked);
}

/// Pipeline steps run in order after implementation and before the judge.
#[tokio::test]
async fn test_pipeline_steps_run_before_verification() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let config = config().with_pipeline(vec![
        PipelineStep {
            id: "review".into(),
            name: "Review".into(),
            order: 2,
            instructions: "Review the diff".into(),
        },
        PipelineStep {
            id: "docs".into(),
            name: "Docs".into(),
            order: 1,
            instructions: "Update the docs".into(),
        },
    ]);
    let orchestrator = orchestrator(&temp_dir, config, &agent);
    orchestrator
        .store()
        .save(&Feature::new("export", "Add export"))
        .expect("save feature");

    let mut events = orchestrator.subscribe();
    let outcome = orchestrator.execute_feature("export").await.expect("run");
    assert_eq!(outcome.status, FeatureStatus::Verified);

    let docs = request_index(&agent, "Update the docs").expect("docs step ran");
    let review = request_index(&agent, "Review the diff").expect("review step ran");
    let judge = request_index(&agent, JUDGE_PROMPT).expect("judge ran");
    assert!(docs < review && review < judge);
    assert_eq!(agent.count_matching(PIPELINE_PROMPT), 2);

    let first = wait_for(&mut events, |event| {
        matches!(event, OrchestratorEvent::PipelineStepStarted { .. })
    })
    .await;
    assert!(matches!(
        first,
        OrchestratorEvent::PipelineStepStarted { ref step_id, .. } if step_id == "docs"
    ));
}

/// A second start of a running feature is refused before any work.
#[tokio::test]
async fn test_duplicate_start_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(ScriptedAgent::new().with_default(Reply::Hang));
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator
        .store()
        .save(&Feature::new("slow", "Slow feature"))
        .expect("save feature");

    let handle = orchestrator.spawn_feature("slow").expect("first start");
    let err = orchestrator.execute_feature("slow").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning(ref id) if id == "slow"));
    assert!(orchestrator.is_running("slow"));

    assert!(orchestrator.stop_feature("slow"));
    let result = handle.await.expect("join");
    assert!(result.unwrap_err().is_cancellation());
    assert!(!orchestrator.is_running("slow"));
    assert!(!orchestrator.stop_feature("slow"));
}

/// A plan that keeps failing the structural check is revised a bounded
/// number of times and then used as is.
#[tokio::test]
async fn test_plan_quality_revisions_are_bounded() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let without_risks = lite_plan("- [ ] T001: Add report | Complexity: low")
        .replace("## Risks", "## Notes");
    let agent = Arc::new(
        judged_agent()
            .on("missing required content", Reply::text(without_risks.clone()))
            .on(PLANNING_PROMPT, Reply::text(without_risks)),
    );
    let config = config();
    let max_revisions = config.max_plan_revisions as usize;
    let orchestrator = orchestrator(&temp_dir, config, &agent);
    orchestrator
        .store()
        .save(&Feature::new("report", "Add report").with_planning_mode(PlanningMode::Lite))
        .expect("save feature");

    let outcome = orchestrator.execute_feature("report").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching("missing required content"), max_revisions);
    assert_eq!(agent.count_matching(TASK_PROMPT), 1);
    let plan = orchestrator
        .store()
        .get("report")
        .expect("load")
        .plan_spec
        .expect("plan");
    assert_eq!(plan.quality_issues, vec!["Missing section: Risks".to_string()]);
}
