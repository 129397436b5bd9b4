//! Post-implementation pipeline steps.
//!
//! Each step is one agent call with no planning phase. While a step runs
//! the feature's status is `pipeline_<step id>`, so a crash leaves a marker
//! that recovery can resume from.

use std::time::Instant;

use tracing::info;

use crate::agent::AgentSession;
use crate::config::PipelineStep;
use crate::error::Result;
use crate::events::OrchestratorEvent;
use crate::feature::{Feature, FeatureStatus};
use crate::metrics::Stage;
use crate::plan::prompts::{self, IMPLEMENTATION_SYSTEM_PROMPT};

/// Steps from `step_id` (inclusive) to the end, or `None` when the step is
/// no longer configured.
pub fn steps_from<'a>(steps: &'a [PipelineStep], step_id: &str) -> Option<&'a [PipelineStep]> {
    steps
        .iter()
        .position(|step| step.id == step_id)
        .map(|index| &steps[index..])
}

/// Run the given steps in order.
pub async fn run_steps(
    session: &AgentSession,
    feature: &Feature,
    steps: &[PipelineStep],
) -> Result<()> {
    for step in steps {
        info!(feature_id = %feature.id, step = %step.id, "Running pipeline step");
        session
            .store()
            .set_status(&feature.id, FeatureStatus::Pipeline(step.id.clone()))?;
        session.events().emit(OrchestratorEvent::PipelineStepStarted {
            feature_id: feature.id.clone(),
            step_id: step.id.clone(),
            name: step.name.clone(),
        });

        let started = Instant::now();
        let result = session
            .run(
                prompts::pipeline_step_prompt(feature, step),
                Some(IMPLEMENTATION_SYSTEM_PROMPT),
            )
            .await;
        session
            .metrics()
            .record_stage(session.run_id(), Stage::Pipeline, started.elapsed());
        result?;

        session.events().emit(OrchestratorEvent::PipelineStepComplete {
            feature_id: feature.id.clone(),
            step_id: step.id.clone(),
        });
    }
    Ok(())
}
