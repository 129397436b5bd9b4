//! Resume decisions and startup recovery.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{OrchestratorConfig, PipelineStep};
use crate::error::Result;
use crate::events::OrchestratorEvent;
use crate::feature::{Feature, FeatureStatus, PlanStatus};
use crate::orchestrator::pipeline::steps_from;
use crate::orchestrator::{FeatureOutcome, Orchestrator};

/// Where a feature run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeAction {
    /// Plan and implement from scratch.
    Fresh,
    /// Implement again with earlier output as context.
    Continue { previous_output: String },
    /// Wait again for approval of the stored plan.
    RearmApproval,
    /// Re-run a pipeline step and the ones after it.
    RerunPipeline { step_id: String },
    /// The interrupted step was removed from the configuration.
    FinishPipeline,
}

/// Decide how to resume a feature from what is on disk.
pub fn resume_action(
    feature: &Feature,
    previous_output: Option<String>,
    pipeline: &[PipelineStep],
    auto_approve_plans: bool,
) -> ResumeAction {
    if let Some(step_id) = feature.status.pipeline_step() {
        if previous_output.is_none() {
            return ResumeAction::Fresh;
        }
        return match steps_from(pipeline, step_id) {
            Some(_) => ResumeAction::RerunPipeline {
                step_id: step_id.to_string(),
            },
            None => ResumeAction::FinishPipeline,
        };
    }

    let awaiting_approval = feature
        .plan_spec
        .as_ref()
        .is_some_and(|plan| plan.status == PlanStatus::Generated && plan.content.is_some());
    if awaiting_approval && feature.needs_plan_approval() && !auto_approve_plans {
        return ResumeAction::RearmApproval;
    }

    match previous_output {
        Some(previous_output) => ResumeAction::Continue { previous_output },
        None => ResumeAction::Fresh,
    }
}

/// What startup recovery did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Features resumed from saved output.
    pub resumed: Vec<String>,
    /// In-flight features without output, put back in the queue.
    pub requeued: Vec<String>,
    pub auto_loop_restarted: bool,
    /// Handles of the resumed runs.
    pub handles: Vec<JoinHandle<Result<FeatureOutcome>>>,
}

impl Orchestrator {
    /// Resume interrupted work after a restart.
    ///
    /// Features left `in_progress` or in a pipeline step with saved output
    /// are resumed in the background. Those without output are set back to
    /// `pending` for the auto-loop to start fresh. The auto-loop is
    /// restarted when the saved snapshot says it was running.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.recover_with_concurrency(None)
    }

    /// Like [`Orchestrator::recover`], but a restarted auto-loop uses
    /// `max_concurrency` instead of the snapshot's value when given.
    pub fn recover_with_concurrency(
        &self,
        max_concurrency: Option<usize>,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let snapshot = match self.state_store().load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "Ignoring unreadable execution state");
                None
            }
        };
        if let Some(snapshot) = &snapshot {
            info!(
                auto_loop_active = snapshot.auto_loop_active,
                running = ?snapshot.running_feature_ids,
                saved_at = %snapshot.saved_at,
                "Found execution state from previous run"
            );
        }

        let running = self.running_ids();
        for feature in self.store().list()? {
            if !feature.status.is_in_flight() || running.contains(&feature.id) {
                continue;
            }
            if self.store().has_agent_output(&feature.id) {
                match self.spawn_resume(&feature.id) {
                    Ok(handle) => {
                        info!(feature_id = %feature.id, status = %feature.status, "Resuming interrupted feature");
                        report.resumed.push(feature.id.clone());
                        report.handles.push(handle);
                    }
                    Err(err) => {
                        warn!(feature_id = %feature.id, error = %err, "Failed to resume feature");
                    }
                }
            } else {
                info!(feature_id = %feature.id, "No saved output; requeueing feature");
                self.store().set_status(&feature.id, FeatureStatus::Pending)?;
                report.requeued.push(feature.id.clone());
            }
        }

        if !report.resumed.is_empty() {
            self.events().emit(OrchestratorEvent::FeaturesResumed {
                feature_ids: report.resumed.clone(),
            });
        }

        if let Some(snapshot) = snapshot.filter(|s| s.auto_loop_active) {
            let max_concurrency = max_concurrency.unwrap_or(snapshot.max_concurrency);
            match self.start_auto_loop(Some(max_concurrency)) {
                Ok(()) => report.auto_loop_restarted = true,
                Err(err) => warn!(error = %err, "Failed to restart auto-loop"),
            }
        }
        Ok(report)
    }
}

/// Short label for logs.
pub(crate) fn describe(action: &ResumeAction) -> &'static str {
    match action {
        ResumeAction::Fresh => "fresh",
        ResumeAction::Continue { .. } => "continue",
        ResumeAction::RearmApproval => "rearm_approval",
        ResumeAction::RerunPipeline { .. } => "rerun_pipeline",
        ResumeAction::FinishPipeline => "finish_pipeline",
    }
}

/// Resume action for a feature under the given configuration.
pub(crate) fn action_for(
    feature: &Feature,
    previous_output: Option<String>,
    config: &OrchestratorConfig,
) -> ResumeAction {
    resume_action(
        feature,
        previous_output,
        &config.pipeline,
        config.auto_approve_plans,
    )
}
