//! Restart recovery from on-disk state.

use std::sync::Arc;

use featureloop::config::PipelineStep;
use featureloop::feature::{
    Feature, FeatureStatus, PlanSpec, PlanStatus, PlanningMode, Task, TaskStatus,
};
use featureloop::state::{ExecutionState, ExecutionStateStore};
use featureloop::test_support::{lite_plan, Reply, ScriptedAgent};
use tempfile::TempDir;

use crate::common::*;

/// An in-progress feature with saved output resumes with that output as
/// context instead of starting over.
#[tokio::test]
async fn test_recover_continues_from_saved_output() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    let store = orchestrator.store();
    store
        .save(&Feature::new("auth", "Add auth").with_status(FeatureStatus::InProgress))
        .expect("save feature");
    store
        .write_agent_output("auth", "Created src/auth.rs and half of the tests")
        .expect("write output");

    let mut report = orchestrator.recover().expect("recover");
    assert_eq!(report.resumed, vec!["auth".to_string()]);
    assert!(report.requeued.is_empty());
    assert!(!report.auto_loop_restarted);

    let handle = report.handles.pop().expect("resume handle");
    let outcome = handle.await.expect("join").expect("run");
    assert_eq!(outcome.status, FeatureStatus::Verified);

    assert_eq!(agent.count_matching(IMPLEMENT_PROMPT), 0);
    let continuation = agent
        .prompts()
        .into_iter()
        .find(|prompt| prompt.contains(CONTINUE_PROMPT))
        .expect("continuation prompt");
    assert!(continuation.contains("half of the tests"));

    let output = store
        .read_agent_output("auth")
        .expect("read")
        .expect("output kept");
    assert!(output.starts_with("Created src/auth.rs"));
}

/// Text streamed before a crash is on disk, so the restarted process
/// resumes the feature instead of requeueing it.
#[tokio::test]
async fn test_streamed_output_survives_crash() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let stalling = Arc::new(
        ScriptedAgent::new().on(
            IMPLEMENT_PROMPT,
            Reply::stall("Created src/auth.rs and half the tests"),
        ),
    );
    let crashed = orchestrator(&temp_dir, config(), &stalling);
    crashed
        .store()
        .save(&Feature::new("auth", "Add auth").with_status(FeatureStatus::Pending))
        .expect("save feature");

    let handle = crashed.spawn_feature("auth").expect("spawn");
    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        while !crashed.store().has_agent_output("auth") {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for streamed output");
    handle.abort();
    let _ = handle.await;

    let saved = crashed
        .store()
        .read_agent_output("auth")
        .expect("read")
        .expect("streamed output saved");
    assert!(saved.contains("half the tests"));
    assert_eq!(
        crashed.store().get("auth").expect("load").status,
        FeatureStatus::InProgress
    );

    let agent = Arc::new(judged_agent());
    let restarted = orchestrator(&temp_dir, config(), &agent);
    let mut report = restarted.recover().expect("recover");
    assert_eq!(report.resumed, vec!["auth".to_string()]);
    assert!(report.requeued.is_empty());

    let outcome = report
        .handles
        .pop()
        .expect("resume handle")
        .await
        .expect("join")
        .expect("run");
    assert_eq!(outcome.status, FeatureStatus::Verified);
    let continuation = agent
        .prompts()
        .into_iter()
        .find(|prompt| prompt.contains(CONTINUE_PROMPT))
        .expect("continuation prompt");
    assert!(continuation.contains("half the tests"));
}

/// In-flight features without output go back to the queue untouched.
#[tokio::test]
async fn test_recover_requeues_features_without_output() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator
        .store()
        .save(&Feature::new("auth", "Add auth").with_status(FeatureStatus::InProgress))
        .expect("save feature");
    orchestrator
        .store()
        .save(&Feature::new("done", "Done already").with_status(FeatureStatus::Verified))
        .expect("save feature");

    let report = orchestrator.recover().expect("recover");

    assert!(report.resumed.is_empty());
    assert_eq!(report.requeued, vec!["auth".to_string()]);
    assert!(agent.requests().is_empty());
    assert_eq!(
        orchestrator.store().get("auth").expect("load").status,
        FeatureStatus::Pending
    );
    assert_eq!(
        orchestrator.store().get("done").expect("load").status,
        FeatureStatus::Verified
    );
}

/// Completed tasks of an approved plan are not run again.
#[tokio::test]
async fn test_resume_skips_completed_tasks() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config(), &agent);

    let mut tasks = vec![
        Task::new("T001", "Add model"),
        Task::new("T002", "Add handler"),
        Task::new("T003", "Add docs"),
    ];
    tasks[0].status = TaskStatus::Completed;
    tasks[1].status = TaskStatus::InProgress;
    tasks[1].depends_on = vec!["T001".to_string()];
    let mut plan = PlanSpec::default();
    plan.replace_content(
        lite_plan("- [x] T001: Add model\n- [ ] T002: Add handler | DependsOn: T001\n- [ ] T003: Add docs"),
        tasks,
    );
    plan.status = PlanStatus::Approved;
    orchestrator
        .store()
        .save(
            &Feature::new("api", "Add API")
                .with_status(FeatureStatus::InProgress)
                .with_planning_mode(PlanningMode::Lite)
                .with_plan_spec(plan),
        )
        .expect("save feature");
    orchestrator
        .store()
        .write_agent_output("api", "T001 done")
        .expect("write output");

    let outcome = orchestrator.resume_feature("api").await.expect("resume");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(PLANNING_PROMPT), 0);
    assert_eq!(agent.count_matching(TASK_PROMPT), 2);
    assert_eq!(agent.count_matching("## Current task\nT001"), 0);
    let plan = orchestrator
        .store()
        .get("api")
        .expect("load")
        .plan_spec
        .expect("plan");
    assert_eq!(plan.tasks_completed, 3);
}

/// A generated plan that was waiting for review waits again after restart.
#[tokio::test]
async fn test_resume_rearms_plan_approval() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config(), &agent);

    let content = lite_plan("- [ ] T001: Add search");
    let mut plan = PlanSpec::default();
    plan.replace_content(content.clone(), vec![Task::new("T001", "Add search")]);
    plan.status = PlanStatus::Generated;
    orchestrator
        .store()
        .save(
            &Feature::new("search", "Add search")
                .with_status(FeatureStatus::InProgress)
                .with_planning_mode(PlanningMode::LiteWithApproval)
                .with_plan_approval(true)
                .with_plan_spec(plan),
        )
        .expect("save feature");
    orchestrator
        .store()
        .write_agent_output("search", &content)
        .expect("write output");

    let mut events = orchestrator.subscribe();
    let handle = orchestrator.spawn_resume("search").expect("resume");
    wait_for(&mut events, |event| {
        matches!(
            event,
            featureloop::events::OrchestratorEvent::PlanApprovalRequired { .. }
        )
    })
    .await;
    assert_eq!(agent.count_matching(PLANNING_PROMPT), 0);

    orchestrator
        .approve_plan("search", None, None)
        .expect("approve");
    let outcome = handle.await.expect("join").expect("run");
    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(TASK_PROMPT), 1);
}

/// A crash inside a pipeline step re-runs that step and the ones after it.
#[tokio::test]
async fn test_resume_reruns_interrupted_pipeline_step() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let config = config().with_pipeline(vec![
        PipelineStep {
            id: "docs".into(),
            name: "Docs".into(),
            order: 1,
            instructions: "Update the docs".into(),
        },
        PipelineStep {
            id: "review".into(),
            name: "Review".into(),
            order: 2,
            instructions: "Review the diff".into(),
        },
    ]);
    let orchestrator = orchestrator(&temp_dir, config, &agent);
    orchestrator
        .store()
        .save(
            &Feature::new("export", "Add export")
                .with_status(FeatureStatus::Pipeline("review".to_string())),
        )
        .expect("save feature");
    orchestrator
        .store()
        .write_agent_output("export", "implemented; docs updated")
        .expect("write output");

    let outcome = orchestrator.resume_feature("export").await.expect("resume");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching("Update the docs"), 0);
    assert_eq!(agent.count_matching("Review the diff"), 1);
    assert_eq!(agent.count_matching(IMPLEMENT_PROMPT), 0);
    assert_eq!(agent.count_matching(CONTINUE_PROMPT), 0);
}

/// A saved auto-loop snapshot brings the auto-loop back; an explicit stop
/// removes the snapshot.
#[tokio::test]
async fn test_recover_restarts_auto_loop() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let state_store = ExecutionStateStore::new(temp_dir.path());
    state_store
        .save(&ExecutionState::new(true, 2, Vec::new()))
        .expect("save snapshot");
    let orchestrator = orchestrator(&temp_dir, config(), &agent);

    let report = orchestrator.recover().expect("recover");

    assert!(report.auto_loop_restarted);
    assert!(orchestrator.is_auto_loop_running());
    assert!(orchestrator.stop_auto_loop().await);
    assert!(!orchestrator.is_auto_loop_running());
    assert!(state_store.load().expect("load").is_none());
}

/// An explicit concurrency cap wins over the one saved in the snapshot.
#[tokio::test]
async fn test_recover_concurrency_override() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    ExecutionStateStore::new(temp_dir.path())
        .save(&ExecutionState::new(true, 2, Vec::new()))
        .expect("save snapshot");
    let orchestrator = orchestrator(&temp_dir, config(), &agent);

    let report = orchestrator
        .recover_with_concurrency(Some(5))
        .expect("recover");

    assert!(report.auto_loop_restarted);
    assert_eq!(orchestrator.auto_loop_capacity(), Some(5));
    assert!(orchestrator.stop_auto_loop().await);
}
