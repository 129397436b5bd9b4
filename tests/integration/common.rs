//! Shared fixtures.

use std::sync::Arc;
use std::time::Duration;

use featureloop::events::OrchestratorEvent;
use featureloop::test_support::{Reply, ScriptedAgent};
use featureloop::{Orchestrator, OrchestratorConfig};
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};

pub const PASS_VERDICT: &str = r#"{"verdict": "pass", "issues": [], "recommendations": []}"#;

// Fragments that identify each kind of prompt.
pub const JUDGE_PROMPT: &str = "Evaluate whether the work";
pub const PLANNING_PROMPT: &str = "Plan the following feature";
pub const REVISION_PROMPT: &str = "was reviewed and needs changes";
pub const IMPLEMENT_PROMPT: &str = "Implement the following feature";
pub const CONTINUE_PROMPT: &str = "Continue implementing";
pub const TASK_PROMPT: &str = "You are implementing one task";
pub const FIX_PROMPT: &str = "Automated checks failed";
pub const PIPELINE_PROMPT: &str = "Perform the following follow-up step";

/// Defaults with a fast auto-loop poll.
pub fn config() -> OrchestratorConfig {
    OrchestratorConfig::default().with_poll_interval(Duration::from_millis(10))
}

/// Agent whose judge always passes; everything else answers "Done.".
pub fn judged_agent() -> ScriptedAgent {
    ScriptedAgent::new().on(JUDGE_PROMPT, Reply::text(PASS_VERDICT))
}

pub fn orchestrator(
    dir: &TempDir,
    config: OrchestratorConfig,
    agent: &Arc<ScriptedAgent>,
) -> Orchestrator {
    Orchestrator::new(dir.path(), config, agent.clone()).expect("Failed to build orchestrator")
}

/// Wait up to ten seconds for an event matching `predicate`.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    mut predicate: F,
) -> OrchestratorEvent
where
    F: FnMut(&OrchestratorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

/// Index of the first request whose prompt contains `needle`.
pub fn request_index(agent: &ScriptedAgent, needle: &str) -> Option<usize> {
    agent
        .prompts()
        .iter()
        .position(|prompt| prompt.contains(needle))
}
