//! Auto-loop scheduling and the failure circuit breaker.

use std::sync::Arc;

use featureloop::events::OrchestratorEvent;
use featureloop::feature::{Feature, FeatureStatus};
use featureloop::state::ExecutionStateStore;
use featureloop::test_support::{Reply, ScriptedAgent};
use tempfile::TempDir;

use crate::common::*;

fn pending(id: &str) -> Feature {
    Feature::new(id, format!("Feature {}", id)).with_status(FeatureStatus::Pending)
}

/// Repeated agent failures pause the auto-loop and keep a paused snapshot.
#[tokio::test]
async fn test_repeated_failures_pause_auto_loop() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(ScriptedAgent::new().with_default(Reply::fail("provider exploded")));
    let orchestrator = orchestrator(&temp_dir, config().with_failure_threshold(3), &agent);
    for id in ["a", "b", "c"] {
        orchestrator.store().save(&pending(id)).expect("save feature");
    }

    let mut events = orchestrator.subscribe();
    orchestrator.start_auto_loop(Some(1)).expect("start");
    let paused = wait_for(&mut events, |event| {
        matches!(event, OrchestratorEvent::AutoLoopPaused { .. })
    })
    .await;

    assert!(matches!(
        paused,
        OrchestratorEvent::AutoLoopPaused { failures: 3, .. }
    ));
    assert!(!orchestrator.is_auto_loop_running());
    let snapshot = ExecutionStateStore::new(temp_dir.path())
        .load()
        .expect("load")
        .expect("snapshot kept");
    assert!(!snapshot.auto_loop_active);
}

/// A usage-limit error trips the breaker on the first failure.
#[tokio::test]
async fn test_usage_limit_pauses_immediately() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(ScriptedAgent::new().with_default(Reply::fail("rate limit exceeded")));
    let orchestrator = orchestrator(&temp_dir, config(), &agent);
    orchestrator.store().save(&pending("a")).expect("save feature");

    let mut events = orchestrator.subscribe();
    orchestrator.start_auto_loop(None).expect("start");
    let paused = wait_for(&mut events, |event| {
        matches!(event, OrchestratorEvent::AutoLoopPaused { .. })
    })
    .await;

    assert!(matches!(
        paused,
        OrchestratorEvent::AutoLoopPaused { failures: 1, .. }
    ));
    assert_eq!(agent.requests().len(), 1);
    let feature = orchestrator.store().get("a").expect("load");
    assert_eq!(feature.status, FeatureStatus::Backlog);
    assert!(feature.error.is_some());
}

/// A dependent feature starts only after its dependency is verified.
#[tokio::test]
async fn test_auto_loop_respects_dependencies() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config().with_max_concurrency(2), &agent);
    orchestrator
        .store()
        .save(&pending("schema"))
        .expect("save feature");
    orchestrator
        .store()
        .save(&pending("api").with_dependencies(["schema"]))
        .expect("save feature");

    let mut events = orchestrator.subscribe();
    orchestrator.start_auto_loop(None).expect("start");

    let mut started = Vec::new();
    let mut schema_done = false;
    wait_for(&mut events, |event| match event {
        OrchestratorEvent::FeatureStarted { feature_id, .. } => {
            if feature_id == "api" {
                assert!(schema_done, "api started before schema finished");
            }
            started.push(feature_id.clone());
            false
        }
        OrchestratorEvent::FeatureComplete { feature_id, .. } => {
            schema_done |= feature_id == "schema";
            feature_id == "api"
        }
        _ => false,
    })
    .await;

    assert_eq!(started, vec!["schema".to_string(), "api".to_string()]);
    assert!(orchestrator.stop_auto_loop().await);
    assert_eq!(
        orchestrator.store().get("api").expect("load").status,
        FeatureStatus::Verified
    );
}

/// Starting the auto-loop twice is refused.
#[tokio::test]
async fn test_auto_loop_cannot_start_twice() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent());
    let orchestrator = orchestrator(&temp_dir, config(), &agent);

    let mut events = orchestrator.subscribe();
    orchestrator.start_auto_loop(Some(4)).expect("start");
    assert!(orchestrator.start_auto_loop(None).is_err());
    wait_for(&mut events, |event| {
        matches!(event, OrchestratorEvent::AutoLoopIdle)
    })
    .await;

    assert!(orchestrator.stop_auto_loop().await);
    assert!(!orchestrator.stop_auto_loop().await);
}

/// A verified feature between failures resets the breaker, so two
/// failures, a success and two more failures keep the loop running.
#[tokio::test]
async fn test_success_between_failures_keeps_loop_running() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let agent = Arc::new(judged_agent().on_sequence(
        IMPLEMENT_PROMPT,
        vec![
            Reply::fail("provider exploded"),
            Reply::fail("provider exploded"),
            Reply::text("Done."),
            Reply::fail("provider exploded"),
            Reply::fail("provider exploded"),
            Reply::text("Done."),
        ],
    ));
    let orchestrator = orchestrator(&temp_dir, config().with_failure_threshold(3), &agent);
    for id in ["a", "b"] {
        orchestrator.store().save(&pending(id)).expect("save feature");
    }

    let mut events = orchestrator.subscribe();
    orchestrator.start_auto_loop(Some(1)).expect("start");

    let mut failures = 0;
    let mut verified = Vec::new();
    wait_for(&mut events, |event| match event {
        OrchestratorEvent::AutoLoopPaused { .. } => panic!("auto-loop paused: {:?}", event),
        OrchestratorEvent::FeatureError { .. } => {
            failures += 1;
            false
        }
        OrchestratorEvent::FeatureComplete {
            feature_id, passes, ..
        } => {
            if *passes {
                verified.push(feature_id.clone());
            }
            verified.len() == 2
        }
        _ => false,
    })
    .await;

    assert_eq!(failures, 4);
    assert_eq!(agent.count_matching(IMPLEMENT_PROMPT), 6);
    assert!(orchestrator.is_auto_loop_running());
    assert!(orchestrator.stop_auto_loop().await);
    for id in ["a", "b"] {
        assert_eq!(
            orchestrator.store().get(id).expect("load").status,
            FeatureStatus::Verified
        );
    }
}
