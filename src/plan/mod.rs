//! Planning and plan approval.
//!
//! The [`Planner`] asks the agent for a plan, cleans it up with the
//! structural quality gate, optionally splits oversized tasks, and then
//! either uses it straight away or parks the feature until a human
//! approves or rejects it.

pub mod approval;
pub mod inbox;
pub mod parser;
pub mod prompts;
pub mod quality;

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agent::AgentSession;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::OrchestratorEvent;
use crate::feature::{Complexity, Feature, PlanSpec, PlanStatus, Task};
use crate::metrics::Stage;

pub use approval::{ApprovalDecision, ApprovalHandle, ApprovalRegistry, PendingApproval};
pub use inbox::{ApprovalInbox, SubmittedDecision, Verdict};
pub use parser::{extract_plan, format_task_block, parse_tasks};
pub use quality::{check_plan_quality, PlanQualityReport};

/// What implementation starts from once planning is done.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanOutcome {
    /// Approved plan text; `None` when planning was skipped.
    pub content: Option<String>,
    pub tasks: Vec<Task>,
    /// Reviewer notes given with the approval.
    pub feedback: Option<String>,
}

impl PlanOutcome {
    fn from_spec(plan: &PlanSpec) -> Self {
        Self {
            content: plan.content.clone(),
            tasks: plan.tasks.clone(),
            feedback: plan.feedback.clone(),
        }
    }
}

/// Whether a task list is large enough to warrant one splitting pass.
pub fn needs_subplan(tasks: &[Task], config: &OrchestratorConfig) -> bool {
    let weight: u32 = tasks.iter().map(|task| task.complexity.weight()).sum();
    let high = tasks
        .iter()
        .filter(|task| task.complexity == Complexity::High)
        .count();
    tasks.len() > config.subplan_max_tasks
        || weight > config.subplan_max_weight
        || high >= config.subplan_high_tasks
}

/// Runs the planning phase for one feature.
pub struct Planner<'a> {
    session: &'a AgentSession,
    approvals: &'a ApprovalRegistry,
    config: &'a OrchestratorConfig,
}

impl<'a> Planner<'a> {
    pub fn new(
        session: &'a AgentSession,
        approvals: &'a ApprovalRegistry,
        config: &'a OrchestratorConfig,
    ) -> Self {
        Self {
            session,
            approvals,
            config,
        }
    }

    /// Generate a plan and, when required, wait for its approval.
    pub async fn plan(&self, feature: &Feature) -> Result<PlanOutcome> {
        if !feature.planning_mode.generates_plan() {
            return Ok(PlanOutcome::default());
        }

        let started = Instant::now();
        let result = self.generate(feature).await;
        self.session.metrics().record_stage(
            self.session.run_id(),
            Stage::Planning,
            started.elapsed(),
        );
        let plan = result?;

        if self.requires_approval(feature) {
            self.await_approval(feature).await
        } else {
            let plan = self.mark_approved(feature, None, None, &plan)?;
            Ok(PlanOutcome::from_spec(&plan))
        }
    }

    /// Whether the generated plan must wait for a human.
    pub fn requires_approval(&self, feature: &Feature) -> bool {
        feature.needs_plan_approval() && !self.config.auto_approve_plans
    }

    async fn generate(&self, feature: &Feature) -> Result<PlanSpec> {
        let feature_id = self.session.feature_id();
        self.session.store().update_plan_spec(feature_id, |plan| {
            plan.status = PlanStatus::Generating;
        })?;
        self.session.progress("Generating plan");

        let prompt = prompts::planning_prompt(feature, &self.config.plan_marker);
        let mut content = self.request_plan(prompt, None).await?;
        let mut tasks = parse_tasks(&content);

        let mut report = check_plan_quality(feature.planning_mode, &content, &tasks);
        let mut attempt = 0;
        while !report.passed() && attempt < self.config.max_plan_revisions {
            attempt += 1;
            info!(
                feature_id,
                attempt,
                issues = report.issues.len(),
                "Plan failed quality checks, requesting revision"
            );
            self.session.events().emit(OrchestratorEvent::PlanQualityIssues {
                feature_id: feature_id.to_string(),
                attempt,
                issues: report.issues.clone(),
            });
            self.session.metrics().record_plan_revision(self.session.run_id());

            let prompt = prompts::plan_quality_revision_prompt(
                &content,
                &report.as_bullets(),
                &self.config.plan_marker,
            );
            content = self.request_plan(prompt, Some(&content)).await?;
            tasks = parse_tasks(&content);
            report = check_plan_quality(feature.planning_mode, &content, &tasks);
        }
        if !report.passed() {
            warn!(
                feature_id,
                issues = ?report.issues,
                "Plan still has quality issues after revisions; continuing"
            );
        }

        if !tasks.is_empty() && needs_subplan(&tasks, self.config) {
            info!(feature_id, tasks = tasks.len(), "Splitting oversized plan");
            self.session.progress("Refining plan into smaller tasks");
            let prompt = prompts::subplan_prompt(&content, &tasks, &self.config.plan_marker);
            let refined = self.request_plan(prompt, Some(&content)).await?;
            let refined_tasks = parse_tasks(&refined);
            if refined_tasks.is_empty() {
                warn!(feature_id, "Refined plan had no tasks; keeping the original");
            } else {
                content = refined;
                tasks = refined_tasks;
            }
        }

        let issues = report.issues;
        let plan = self.session.store().update_plan_spec(feature_id, |plan| {
            plan.replace_content(content.clone(), tasks.clone());
            plan.status = PlanStatus::Generated;
            plan.quality_issues = issues.clone();
            plan.approved_at = None;
            plan.reviewed_by_user = false;
        })?;
        self.session.metrics().record_tasks(self.session.run_id(), &plan.tasks);
        self.session.events().emit(OrchestratorEvent::PlanGenerated {
            feature_id: feature_id.to_string(),
            version: plan.version,
            tasks: plan.tasks.len(),
        });
        Ok(plan)
    }

    /// Wait for a decision on the stored plan, revising after each
    /// rejection that carries feedback or edits.
    pub async fn await_approval(&self, feature: &Feature) -> Result<PlanOutcome> {
        let feature_id = self.session.feature_id();
        let cancel = self.session.cancel_token();

        loop {
            let plan = self
                .session
                .store()
                .get(feature_id)?
                .plan_spec
                .unwrap_or_default();
            let handle = self.approvals.register(feature_id)?;
            info!(feature_id, version = plan.version, "Waiting for plan approval");
            self.session.events().emit(OrchestratorEvent::PlanApprovalRequired {
                feature_id: feature_id.to_string(),
                version: plan.version,
            });

            let decision = tokio::select! {
                decision = handle.wait() => decision,
                _ = cancel.cancelled() => {
                    self.approvals.cancel(feature_id);
                    ApprovalDecision::Cancelled
                }
            };
            debug!(feature_id, ?decision, "Plan approval resolved");
            let revise = decision.is_revision_request();

            match decision {
                ApprovalDecision::Approved {
                    edited_plan,
                    feedback,
                } => {
                    let plan = self.mark_approved(feature, edited_plan, feedback, &plan)?;
                    return Ok(PlanOutcome::from_spec(&plan));
                }
                ApprovalDecision::Rejected {
                    feedback,
                    edited_plan,
                } => {
                    self.session.events().emit(OrchestratorEvent::PlanRejected {
                        feature_id: feature_id.to_string(),
                        feedback: feedback.clone(),
                    });
                    if revise {
                        self.revise_after_rejection(feature, &plan, feedback, edited_plan)
                            .await?;
                        continue;
                    }
                    info!(feature_id, "Plan rejected without feedback; stopping feature");
                    self.session.store().update_plan_spec(feature_id, |plan| {
                        plan.status = PlanStatus::Rejected;
                    })?;
                    return Err(OrchestratorError::PlanRejected(feature_id.to_string()));
                }
                ApprovalDecision::TimedOut => {
                    warn!(feature_id, "Plan approval timed out");
                    self.session.store().update_plan_spec(feature_id, |plan| {
                        plan.status = PlanStatus::Rejected;
                    })?;
                    return Err(OrchestratorError::ApprovalTimedOut(feature_id.to_string()));
                }
                ApprovalDecision::Cancelled => return Err(OrchestratorError::Cancelled),
            }
        }
    }

    async fn revise_after_rejection(
        &self,
        feature: &Feature,
        plan: &PlanSpec,
        feedback: Option<String>,
        edited_plan: Option<String>,
    ) -> Result<()> {
        let feature_id = self.session.feature_id();
        let base = edited_plan
            .filter(|text| !text.trim().is_empty())
            .or_else(|| plan.content.clone())
            .unwrap_or_default();
        let feedback = feedback.filter(|text| !text.trim().is_empty());

        self.session.progress("Revising plan from reviewer feedback");
        self.session.metrics().record_plan_revision(self.session.run_id());
        let started = Instant::now();
        let prompt = prompts::plan_feedback_revision_prompt(
            feature,
            &base,
            feedback.as_deref(),
            &self.config.plan_marker,
        );
        let revised = self.request_plan(prompt, Some(&base)).await;
        self.session.metrics().record_stage(
            self.session.run_id(),
            Stage::Planning,
            started.elapsed(),
        );
        let revised = revised?;
        let tasks = parse_tasks(&revised);

        let updated = self.session.store().update_plan_spec(feature_id, |plan| {
            plan.replace_content(revised.clone(), tasks.clone());
            plan.status = PlanStatus::Generated;
            plan.feedback = feedback.clone();
        })?;
        self.session.metrics().record_tasks(self.session.run_id(), &updated.tasks);
        self.session.events().emit(OrchestratorEvent::PlanRevisionRequested {
            feature_id: feature_id.to_string(),
            version: updated.version,
            reason: feedback.unwrap_or_else(|| "edited by reviewer".to_string()),
        });
        Ok(())
    }

    fn mark_approved(
        &self,
        feature: &Feature,
        edited_plan: Option<String>,
        feedback: Option<String>,
        current: &PlanSpec,
    ) -> Result<PlanSpec> {
        let feature_id = self.session.feature_id();
        let edited = edited_plan.filter(|text| !text.trim().is_empty());
        let reviewed = self.requires_approval(feature);
        let edited_tasks = edited.as_deref().map(parse_tasks);

        let plan = self.session.store().update_plan_spec(feature_id, |plan| {
            if let Some(content) = &edited {
                let tasks = match &edited_tasks {
                    Some(tasks) if !tasks.is_empty() => tasks.clone(),
                    _ => current.tasks.clone(),
                };
                plan.replace_content(content.clone(), tasks);
            }
            plan.status = PlanStatus::Approved;
            plan.approved_at = Some(Utc::now());
            plan.reviewed_by_user = reviewed;
            if feedback.is_some() {
                plan.feedback = feedback.clone();
            }
        })?;
        if reviewed {
            self.session.events().emit(OrchestratorEvent::PlanApproved {
                feature_id: feature_id.to_string(),
                version: plan.version,
                edited: edited.is_some(),
            });
        }
        Ok(plan)
    }

    /// One planning call. Output without the marker is used whole; an empty
    /// answer falls back to `previous` or fails.
    async fn request_plan(&self, prompt: String, previous: Option<&str>) -> Result<String> {
        let feature_id = self.session.feature_id();
        let output = self.session.run(prompt, None).await?;
        let text = output.best_text();
        let content = match extract_plan(text, &self.config.plan_marker) {
            Some(plan) => plan,
            None => {
                warn!(feature_id, "Plan completion marker not found; using full response");
                text.trim().to_string()
            }
        };
        if !content.trim().is_empty() {
            return Ok(content);
        }
        match previous {
            Some(previous) => {
                warn!(feature_id, "Planner returned an empty plan; keeping the previous one");
                Ok(previous.to_string())
            }
            None => Err(OrchestratorError::PlanGenerationFailed(format!(
                "agent returned no plan for {}",
                feature_id
            ))),
        }
    }
}
