//! Quality gates with a fix loop, followed by the judge with a revision loop.

use std::time::Instant;

use tracing::{info, warn};

use crate::agent::AgentSession;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::events::OrchestratorEvent;
use crate::feature::{Feature, Task};
use crate::metrics::Stage;
use crate::plan::prompts::{self, IMPLEMENTATION_SYSTEM_PROMPT, JUDGE_SYSTEM_PROMPT};
use crate::quality::gates::{
    GateProgressState, GateProgressUpdate, QualityGateRunner, QualityReport,
};
use crate::quality::judge::{parse_verdict, JudgeVerdict, Verdict};

/// Result of the verification phase.
#[derive(Debug, Clone, Default)]
pub struct VerificationOutcome {
    /// Automated testing was turned off for the feature.
    pub skipped: bool,
    pub gates_passed: bool,
    pub judge_passed: bool,
    pub quality: Option<QualityReport>,
    pub verdict: Option<JudgeVerdict>,
}

impl VerificationOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Gates and judge both passed.
    pub fn passed(&self) -> bool {
        !self.skipped && self.gates_passed && self.judge_passed
    }

    /// Human-readable summary for the completion event.
    pub fn summary(&self) -> String {
        if self.skipped {
            return "Automated verification skipped; manual review required".to_string();
        }
        let mut summary = self
            .quality
            .as_ref()
            .map(QualityReport::summary)
            .unwrap_or_else(|| "No quality gates configured".to_string());
        if let Some(verdict) = &self.verdict {
            summary.push_str(&format!("; judge: {}", verdict.verdict.as_str()));
        }
        summary
    }
}

pub struct Verifier<'a> {
    session: &'a AgentSession,
    config: &'a OrchestratorConfig,
    runner: QualityGateRunner,
}

impl<'a> Verifier<'a> {
    pub fn new(session: &'a AgentSession, config: &'a OrchestratorConfig) -> Self {
        Self {
            session,
            config,
            runner: QualityGateRunner::new(config.quality_gates.clone(), config.gate_timeout()),
        }
    }

    /// Run gates (fixing failures up to the configured bound) and, when
    /// they pass, the judge.
    pub async fn verify(&self, feature: &Feature, tasks: &[Task]) -> Result<VerificationOutcome> {
        if feature.skip_tests {
            info!(feature_id = %feature.id, "Skipping automated verification");
            return Ok(VerificationOutcome::skipped());
        }

        let report = self.run_gates_with_fixes(feature).await?;
        let mut outcome = VerificationOutcome {
            gates_passed: report.passed(),
            quality: Some(report),
            ..VerificationOutcome::default()
        };
        if !outcome.gates_passed {
            warn!(feature_id = %feature.id, "Quality gates still failing after fix attempts");
            return Ok(outcome);
        }

        if self.config.judge_enabled {
            let quality_summary = outcome
                .quality
                .as_ref()
                .map(QualityReport::summary)
                .unwrap_or_default();
            let verdict = self.run_judge(feature, tasks, &quality_summary).await?;
            outcome.judge_passed = verdict.passed();
            outcome.verdict = Some(verdict);
        } else {
            outcome.judge_passed = true;
        }
        Ok(outcome)
    }

    async fn run_gates_with_fixes(&self, feature: &Feature) -> Result<QualityReport> {
        let mut attempt = 1;
        loop {
            let started = Instant::now();
            let report = self
                .runner
                .run_with_progress(
                    self.session.working_dir(),
                    self.session.cancel_token(),
                    |update| self.session.progress(gate_progress_message(&update)),
                )
                .await;
            self.record(Stage::Verification, started);
            let report = report?;

            let checks = report.check_summaries();
            self.session
                .metrics()
                .record_quality(self.session.run_id(), checks.clone());
            self.session.events().emit(OrchestratorEvent::QualityMetrics {
                feature_id: feature.id.clone(),
                attempt,
                passed: report.passed(),
                summary: report.summary(),
                checks,
            });

            if report.passed() || attempt > self.config.max_quality_fix_attempts {
                return Ok(report);
            }

            info!(feature_id = %feature.id, attempt, "Requesting fix for failed quality gates");
            self.session.progress(format!("Fixing failed checks: {}", report.summary()));
            let started = Instant::now();
            let fix = self
                .session
                .run(
                    prompts::quality_fix_prompt(feature, &report.failure_details()),
                    Some(IMPLEMENTATION_SYSTEM_PROMPT),
                )
                .await;
            self.record(Stage::Verification, started);
            fix?;
            attempt += 1;
        }
    }

    async fn run_judge(
        &self,
        feature: &Feature,
        tasks: &[Task],
        quality_summary: &str,
    ) -> Result<JudgeVerdict> {
        let task_summary = prompts::task_summary(tasks);
        let mut attempt = 1;
        loop {
            let output = self
                .session
                .store()
                .read_agent_output(&feature.id)?
                .unwrap_or_default();
            let prompt = prompts::judge_prompt(feature, &task_summary, quality_summary, &output);

            self.session.progress("Evaluating implementation");
            let started = Instant::now();
            let response = self
                .session
                .run_read_only(prompt, Some(JUDGE_SYSTEM_PROMPT))
                .await;
            self.record(Stage::Judge, started);
            let verdict = parse_verdict(response?.best_text());

            self.session
                .metrics()
                .record_judge(self.session.run_id(), verdict.verdict.as_str());
            self.session.events().emit(OrchestratorEvent::JudgeResult {
                feature_id: feature.id.clone(),
                attempt,
                verdict: verdict.verdict.as_str().to_string(),
                issues: verdict.issues.clone(),
            });
            info!(
                feature_id = %feature.id,
                attempt,
                verdict = verdict.verdict.as_str(),
                "Judge verdict"
            );

            if verdict.verdict != Verdict::Revise || attempt > self.config.max_judge_attempts {
                return Ok(verdict);
            }

            self.session.progress("Addressing reviewer issues");
            let started = Instant::now();
            let revision = self
                .session
                .run(
                    prompts::judge_revision_prompt(feature, &verdict),
                    Some(IMPLEMENTATION_SYSTEM_PROMPT),
                )
                .await;
            self.record(Stage::Judge, started);
            revision?;
            attempt += 1;
        }
    }

    fn record(&self, stage: Stage, started: Instant) {
        self.session
            .metrics()
            .record_stage(self.session.run_id(), stage, started.elapsed());
    }
}

fn gate_progress_message(update: &GateProgressUpdate) -> String {
    if !update.is_completed() {
        return format!("Running quality gate: {}", update.gate_name);
    }
    let outcome = if update.state == GateProgressState::Passed {
        "passed"
    } else {
        "failed"
    };
    match update.format_duration() {
        Some(duration) => format!("Quality gate {} {} in {}", update.gate_name, outcome, duration),
        None => format!("Quality gate {} {}", update.gate_name, outcome),
    }
}
