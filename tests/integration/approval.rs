//! Plan approval flows.

use std::sync::Arc;

use featureloop::error::OrchestratorError;
use featureloop::events::OrchestratorEvent;
use featureloop::feature::{Feature, FeatureStatus, PlanStatus, PlanningMode};
use featureloop::plan::{ApprovalInbox, SubmittedDecision};
use featureloop::test_support::{lite_plan, Reply, ScriptedAgent};
use featureloop::Orchestrator;
use tempfile::TempDir;

use crate::common::*;

fn reviewed_feature(id: &str) -> Feature {
    Feature::new(id, "Add search")
        .with_planning_mode(PlanningMode::LiteWithApproval)
        .with_plan_approval(true)
}

fn planning_agent() -> ScriptedAgent {
    judged_agent()
        .on(
            REVISION_PROMPT,
            Reply::text(lite_plan(
                "- [ ] T001: Add index | Complexity: low\n- [ ] T002: Add query | DependsOn: T001 | Complexity: low",
            )),
        )
        .on(
            PLANNING_PROMPT,
            Reply::text(lite_plan("- [ ] T001: Add search | Complexity: low")),
        )
}

fn setup(agent: &Arc<ScriptedAgent>) -> (TempDir, Orchestrator) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let orchestrator = orchestrator(&temp_dir, config(), agent);
    orchestrator
        .store()
        .save(&reviewed_feature("search"))
        .expect("save feature");
    (temp_dir, orchestrator)
}

fn approval_required(event: &OrchestratorEvent) -> Option<u32> {
    match event {
        OrchestratorEvent::PlanApprovalRequired { feature_id, version } if feature_id == "search" => {
            Some(*version)
        }
        _ => None,
    }
}

/// The run parks on the generated plan until it is approved.
#[tokio::test]
async fn test_approved_plan_is_implemented() {
    let agent = Arc::new(planning_agent());
    let (_temp_dir, orchestrator) = setup(&agent);
    let mut events = orchestrator.subscribe();

    let handle = orchestrator.spawn_feature("search").expect("start");
    wait_for(&mut events, |event| approval_required(event).is_some()).await;

    let pending = orchestrator.pending_approvals();
    assert_eq!(pending.len(), 1);
    assert_eq!(agent.count_matching(TASK_PROMPT), 0);
    let plan = orchestrator
        .store()
        .get("search")
        .expect("load")
        .plan_spec
        .expect("plan");
    assert_eq!(plan.status, PlanStatus::Generated);

    orchestrator
        .approve_plan("search", None, Some("Keep it small".to_string()))
        .expect("approve");
    let outcome = handle.await.expect("join").expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(TASK_PROMPT), 1);
    let plan = orchestrator
        .store()
        .get("search")
        .expect("load")
        .plan_spec
        .expect("plan");
    assert_eq!(plan.status, PlanStatus::Approved);
    assert!(plan.reviewed_by_user);
    assert!(plan.approved_at.is_some());
    assert_eq!(plan.feedback.as_deref(), Some("Keep it small"));
    assert!(orchestrator.pending_approvals().is_empty());
}

/// Rejecting with feedback revises the plan once and asks again.
#[tokio::test]
async fn test_rejection_with_feedback_revises_and_rearms() {
    let agent = Arc::new(planning_agent());
    let (_temp_dir, orchestrator) = setup(&agent);
    let mut events = orchestrator.subscribe();

    let handle = orchestrator.spawn_feature("search").expect("start");
    let first = wait_for(&mut events, |event| approval_required(event).is_some()).await;
    let first_version = approval_required(&first).expect("version");

    orchestrator
        .reject_plan("search", Some("Split indexing from querying".to_string()), None)
        .expect("reject");
    let second = wait_for(&mut events, |event| approval_required(event).is_some()).await;
    let second_version = approval_required(&second).expect("version");
    assert!(second_version > first_version);
    assert_eq!(agent.count_matching(REVISION_PROMPT), 1);
    assert_eq!(agent.count_matching(PLANNING_PROMPT), 1);

    let revision = agent
        .prompts()
        .into_iter()
        .find(|prompt| prompt.contains(REVISION_PROMPT))
        .expect("revision prompt");
    assert!(revision.contains("Split indexing from querying"));

    orchestrator
        .approve_plan("search", None, None)
        .expect("approve");
    let outcome = handle.await.expect("join").expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(TASK_PROMPT), 2);
    let plan = orchestrator
        .store()
        .get("search")
        .expect("load")
        .plan_spec
        .expect("plan");
    assert_eq!(plan.version, second_version);
    assert_eq!(plan.tasks_total, 2);
}

/// A plain rejection stops the feature and returns it to the backlog.
#[tokio::test]
async fn test_rejection_without_feedback_stops_feature() {
    let agent = Arc::new(planning_agent());
    let (_temp_dir, orchestrator) = setup(&agent);
    let mut events = orchestrator.subscribe();

    let handle = orchestrator.spawn_feature("search").expect("start");
    wait_for(&mut events, |event| approval_required(event).is_some()).await;

    orchestrator
        .reject_plan("search", None, None)
        .expect("reject");
    let err = handle.await.expect("join").unwrap_err();

    assert!(matches!(err, OrchestratorError::PlanRejected(ref id) if id == "search"));
    assert!(err.is_cancellation());
    assert_eq!(agent.count_matching(REVISION_PROMPT), 0);
    assert_eq!(agent.count_matching(TASK_PROMPT), 0);

    let feature = orchestrator.store().get("search").expect("load");
    assert_eq!(feature.status, FeatureStatus::Backlog);
    assert_eq!(
        feature.plan_spec.expect("plan").status,
        PlanStatus::Rejected
    );
}

/// An approval with an edited plan runs the edited tasks.
#[tokio::test]
async fn test_edited_plan_replaces_tasks() {
    let agent = Arc::new(planning_agent());
    let (_temp_dir, orchestrator) = setup(&agent);
    let mut events = orchestrator.subscribe();

    let handle = orchestrator.spawn_feature("search").expect("start");
    wait_for(&mut events, |event| approval_required(event).is_some()).await;

    let edited = lite_plan(
        "- [ ] T001: Add search | Complexity: low\n- [ ] T002: Add ranking | DependsOn: T001 | Complexity: low\n- [ ] T003: Add paging | Complexity: low",
    );
    orchestrator
        .approve_plan("search", Some(edited), None)
        .expect("approve");
    let outcome = handle.await.expect("join").expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    assert_eq!(agent.count_matching(TASK_PROMPT), 3);
    assert!(agent
        .prompts()
        .iter()
        .any(|prompt| prompt.contains("## Current task\nT002: Add ranking")));
}

/// Auto-approve skips the wait even when the feature asks for review.
#[tokio::test]
async fn test_auto_approve_skips_review() {
    let agent = Arc::new(planning_agent());
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let orchestrator = orchestrator(&temp_dir, config().with_auto_approve_plans(true), &agent);
    orchestrator
        .store()
        .save(&reviewed_feature("search"))
        .expect("save feature");

    let outcome = orchestrator.execute_feature("search").await.expect("run");

    assert_eq!(outcome.status, FeatureStatus::Verified);
    let plan = orchestrator
        .store()
        .get("search")
        .expect("load")
        .plan_spec
        .expect("plan");
    assert_eq!(plan.status, PlanStatus::Approved);
    assert!(!plan.reviewed_by_user);
}

/// Stopping a feature cancels its approval wait.
#[tokio::test]
async fn test_stop_cancels_pending_approval() {
    let agent = Arc::new(planning_agent());
    let (_temp_dir, orchestrator) = setup(&agent);
    let mut events = orchestrator.subscribe();

    let handle = orchestrator.spawn_feature("search").expect("start");
    wait_for(&mut events, |event| approval_required(event).is_some()).await;

    assert!(orchestrator.stop_feature("search"));
    let err = handle.await.expect("join").unwrap_err();
    assert!(matches!(err, OrchestratorError::Cancelled));
    assert!(orchestrator.pending_approvals().is_empty());
    assert!(matches!(
        orchestrator.approve_plan("search", None, None),
        Err(OrchestratorError::NoPendingApproval(_))
    ));
}

/// A decision left in the approval inbox by another process resolves the
/// waiting plan.
#[tokio::test]
async fn test_submitted_decision_resolves_waiting_plan() {
    let agent = Arc::new(planning_agent());
    let (temp_dir, orchestrator) = setup(&agent);
    let mut events = orchestrator.subscribe();
    let inbox_task = orchestrator.start_approval_inbox();

    let handle = orchestrator.spawn_feature("search").expect("start");
    wait_for(&mut events, |event| approval_required(event).is_some()).await;

    ApprovalInbox::new(temp_dir.path())
        .submit(
            "search",
            &SubmittedDecision::approve(None, Some("Looks right".to_string())),
        )
        .expect("submit");
    let outcome = handle.await.expect("join").expect("run");
    inbox_task.abort();

    assert_eq!(outcome.status, FeatureStatus::Verified);
    let plan = orchestrator
        .store()
        .get("search")
        .expect("load")
        .plan_spec
        .expect("plan");
    assert_eq!(plan.status, PlanStatus::Approved);
    assert_eq!(plan.feedback.as_deref(), Some("Looks right"));
    assert!(ApprovalInbox::new(temp_dir.path())
        .peek("search")
        .expect("peek")
        .is_none());
}

/// Decisions for features that are not waiting stay in the inbox.
#[tokio::test]
async fn test_submitted_decision_waits_for_pending_approval() {
    let agent = Arc::new(planning_agent());
    let (temp_dir, orchestrator) = setup(&agent);
    let inbox = ApprovalInbox::new(temp_dir.path());
    inbox
        .submit("search", &SubmittedDecision::reject(None, None))
        .expect("submit");

    assert!(orchestrator
        .apply_submitted_decisions()
        .expect("apply")
        .is_empty());
    assert!(inbox.peek("search").expect("peek").is_some());
}
