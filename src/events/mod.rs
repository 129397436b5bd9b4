//! Orchestrator events.
//!
//! Events are a fire-and-forget output channel for observers (UIs, the
//! journal, tests). Nothing in the orchestrator reads them back.

pub mod journal;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

pub use journal::{EventJournal, JournalRecord};

/// Default capacity of the broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Result of one quality check, as reported in events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub name: String,
    /// "pass", "fail" or "skipped".
    pub status: String,
    pub duration_ms: u64,
}

/// Everything the orchestrator reports while it works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    FeatureStarted {
        feature_id: String,
        title: String,
        model: Option<String>,
        resumed: bool,
    },
    FeatureProgress {
        feature_id: String,
        message: String,
    },
    FeatureToolUse {
        feature_id: String,
        tool: String,
    },
    FeatureComplete {
        feature_id: String,
        passes: bool,
        message: String,
    },
    FeatureError {
        feature_id: String,
        error: String,
        category: String,
    },
    PlanGenerated {
        feature_id: String,
        version: u32,
        tasks: usize,
    },
    PlanQualityIssues {
        feature_id: String,
        attempt: u32,
        issues: Vec<String>,
    },
    PlanApprovalRequired {
        feature_id: String,
        version: u32,
    },
    PlanApproved {
        feature_id: String,
        version: u32,
        edited: bool,
    },
    PlanRejected {
        feature_id: String,
        feedback: Option<String>,
    },
    PlanRevisionRequested {
        feature_id: String,
        version: u32,
        reason: String,
    },
    TaskStarted {
        feature_id: String,
        task_id: String,
        description: String,
        completed: usize,
        total: usize,
    },
    TaskComplete {
        feature_id: String,
        task_id: String,
        success: bool,
        completed: usize,
        total: usize,
    },
    PhaseComplete {
        feature_id: String,
        phase: String,
    },
    PipelineStepStarted {
        feature_id: String,
        step_id: String,
        name: String,
    },
    PipelineStepComplete {
        feature_id: String,
        step_id: String,
    },
    QualityMetrics {
        feature_id: String,
        attempt: u32,
        passed: bool,
        summary: String,
        checks: Vec<CheckSummary>,
    },
    JudgeResult {
        feature_id: String,
        attempt: u32,
        verdict: String,
        issues: Vec<String>,
    },
    MetricsUpdated {
        feature_id: String,
        run_id: String,
        status: String,
    },
    FeaturesResumed {
        feature_ids: Vec<String>,
    },
    AutoLoopStarted {
        max_concurrency: usize,
    },
    AutoLoopStopped,
    AutoLoopIdle,
    AutoLoopPaused {
        reason: String,
        failures: u32,
    },
}

impl OrchestratorEvent {
    /// Feature the event belongs to, if any.
    pub fn feature_id(&self) -> Option<&str> {
        use OrchestratorEvent::*;
        match self {
            FeatureStarted { feature_id, .. }
            | FeatureProgress { feature_id, .. }
            | FeatureToolUse { feature_id, .. }
            | FeatureComplete { feature_id, .. }
            | FeatureError { feature_id, .. }
            | PlanGenerated { feature_id, .. }
            | PlanQualityIssues { feature_id, .. }
            | PlanApprovalRequired { feature_id, .. }
            | PlanApproved { feature_id, .. }
            | PlanRejected { feature_id, .. }
            | PlanRevisionRequested { feature_id, .. }
            | TaskStarted { feature_id, .. }
            | TaskComplete { feature_id, .. }
            | PhaseComplete { feature_id, .. }
            | PipelineStepStarted { feature_id, .. }
            | PipelineStepComplete { feature_id, .. }
            | QualityMetrics { feature_id, .. }
            | JudgeResult { feature_id, .. }
            | MetricsUpdated { feature_id, .. } => Some(feature_id),
            FeaturesResumed { .. }
            | AutoLoopStarted { .. }
            | AutoLoopStopped
            | AutoLoopIdle
            | AutoLoopPaused { .. } => None,
        }
    }

    /// Stable snake_case name of the event.
    pub fn kind(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Broadcast channel for orchestrator events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: OrchestratorEvent) {
        debug!(event = %event.kind(), feature_id = ?event.feature_id(), "event");
        let _ = self.tx.send(event);
    }
}
