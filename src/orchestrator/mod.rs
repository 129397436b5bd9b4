//! Feature execution orchestrator.
//!
//! Drives one feature through its lifecycle:
//!
//! ```text
//! backlog/pending/ready -> in_progress -> [pipeline_<step>]* -> verified | waiting_approval
//!                                      \-> backlog (on failure)
//! ```
//!
//! Planning, approval, task scheduling, pipeline steps and verification are
//! delegated to their own modules; this module owns the running-feature
//! registry, finalization and the wiring between the pieces.

pub mod auto_loop;
pub mod breaker;
pub mod pipeline;
pub mod recovery;
pub mod verify;
pub mod workdir;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::{AgentClient, AgentSession};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::events::{EventBus, EventJournal, OrchestratorEvent, DEFAULT_EVENT_BUFFER};
use crate::feature::{Feature, FeatureStatus, FeatureStore, PlanStatus, Task, TaskStatus};
use crate::metrics::{MetricsCollector, MetricsStore, Stage};
use crate::parallel::{SchedulerUpdate, TaskExecutor, TaskScheduler};
use crate::plan::prompts::{self, IMPLEMENTATION_SYSTEM_PROMPT};
use crate::plan::{
    ApprovalInbox, ApprovalRegistry, PendingApproval, PlanOutcome, Planner, Verdict,
};
use crate::state::{ExecutionState, ExecutionStateStore};

pub use auto_loop::dependency_satisfied;
pub use breaker::{BreakerDecision, FailureTracker};
pub use recovery::{resume_action, RecoveryReport, ResumeAction};
pub use verify::{VerificationOutcome, Verifier};

/// In-memory record of a live feature run.
#[derive(Debug, Clone)]
struct RunningFeature {
    registration: u64,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    working_dir: Option<PathBuf>,
    model: Option<String>,
    run_id: Option<String>,
}

/// A live feature run, as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningFeatureInfo {
    pub feature_id: String,
    pub started_at: DateTime<Utc>,
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub run_id: Option<String>,
}

/// How a feature run ended when it reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureOutcome {
    pub feature_id: String,
    pub status: FeatureStatus,
    /// Verification passed, or was not required.
    pub passed: bool,
    pub message: String,
}

/// Ownership of a registry slot for the duration of one run.
#[derive(Debug)]
struct Registration {
    feature_id: String,
    id: u64,
    cancel: CancellationToken,
}

/// Terminal status chosen by a successful lifecycle.
#[derive(Debug)]
struct Completion {
    status: FeatureStatus,
    passed: bool,
    message: String,
}

impl Completion {
    fn from_verification(feature: &Feature, outcome: &VerificationOutcome) -> Self {
        let status = if !feature.skip_tests && outcome.passed() {
            FeatureStatus::Verified
        } else {
            FeatureStatus::WaitingApproval
        };
        Self {
            status,
            passed: outcome.skipped || outcome.passed(),
            message: outcome.summary(),
        }
    }

    fn without_verification(feature: &Feature, message: impl Into<String>) -> Self {
        let status = if feature.skip_tests {
            FeatureStatus::WaitingApproval
        } else {
            FeatureStatus::Verified
        };
        Self {
            status,
            passed: true,
            message: message.into(),
        }
    }
}

struct Inner {
    project_root: PathBuf,
    config: OrchestratorConfig,
    agent: Arc<dyn AgentClient>,
    store: FeatureStore,
    state_store: ExecutionStateStore,
    metrics: MetricsCollector,
    events: EventBus,
    approvals: ApprovalRegistry,
    scheduler: TaskScheduler,
    running: Mutex<HashMap<String, RunningFeature>>,
    next_registration: AtomicU64,
    auto_loop: Mutex<Option<auto_loop::AutoLoopHandle>>,
    breaker: Mutex<FailureTracker>,
}

/// Runs features for one project. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("project_root", &self.inner.project_root)
            .field("running", &self.running_ids().len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        project_root: impl Into<PathBuf>,
        config: OrchestratorConfig,
        agent: Arc<dyn AgentClient>,
    ) -> Result<Self> {
        let project_root = project_root.into();
        let config = config.normalized();
        let store = FeatureStore::new(&project_root)?;
        let metrics = MetricsCollector::new(
            MetricsStore::new(&project_root, config.metrics_history_limit),
            config.max_concurrency,
        );
        let inner = Inner {
            state_store: ExecutionStateStore::new(&project_root),
            events: EventBus::new(DEFAULT_EVENT_BUFFER),
            approvals: ApprovalRegistry::new(config.approval_timeout()),
            scheduler: TaskScheduler::with_concurrency(config.task_concurrency),
            breaker: Mutex::new(FailureTracker::new(
                config.failure_threshold,
                config.failure_window(),
            )),
            running: Mutex::new(HashMap::new()),
            next_registration: AtomicU64::new(1),
            auto_loop: Mutex::new(None),
            project_root,
            config,
            agent,
            store,
            metrics,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.inner.project_root
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &FeatureStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    pub(crate) fn state_store(&self) -> &ExecutionStateStore {
        &self.inner.state_store
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Append every event to the project's JSONL journal.
    pub fn start_journal(&self) -> Result<JoinHandle<()>> {
        let journal = EventJournal::new(&self.inner.project_root)?;
        Ok(journal.spawn_subscriber(&self.inner.events))
    }

    // ------------------------------------------------------------------
    // Running-feature registry
    // ------------------------------------------------------------------

    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningFeature>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the feature's slot. Check and insert happen under one lock,
    /// before the run does any I/O.
    fn register(&self, feature_id: &str) -> Result<Registration> {
        let mut running = self.running();
        if running.contains_key(feature_id) {
            return Err(OrchestratorError::AlreadyRunning(feature_id.to_string()));
        }
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        running.insert(
            feature_id.to_string(),
            RunningFeature {
                registration: id,
                cancel: cancel.clone(),
                started_at: Utc::now(),
                working_dir: None,
                model: None,
                run_id: None,
            },
        );
        Ok(Registration {
            feature_id: feature_id.to_string(),
            id,
            cancel,
        })
    }

    fn update_running<F>(&self, registration: &Registration, update: F)
    where
        F: FnOnce(&mut RunningFeature),
    {
        if let Some(entry) = self.running().get_mut(&registration.feature_id) {
            if entry.registration == registration.id {
                update(entry);
            }
        }
    }

    /// Release the slot unless a newer run already owns it.
    fn unregister(&self, registration: &Registration) {
        let mut running = self.running();
        let owned = running
            .get(&registration.feature_id)
            .is_some_and(|entry| entry.registration == registration.id);
        if owned {
            running.remove(&registration.feature_id);
        }
    }

    pub(crate) fn running_ids(&self) -> HashSet<String> {
        self.running().keys().cloned().collect()
    }

    pub fn is_running(&self, feature_id: &str) -> bool {
        self.running().contains_key(feature_id)
    }

    /// Live runs, oldest first.
    pub fn running_features(&self) -> Vec<RunningFeatureInfo> {
        let mut features: Vec<_> = self
            .running()
            .iter()
            .map(|(feature_id, entry)| RunningFeatureInfo {
                feature_id: feature_id.clone(),
                started_at: entry.started_at,
                working_dir: entry.working_dir.clone(),
                model: entry.model.clone(),
                run_id: entry.run_id.clone(),
            })
            .collect();
        features.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.feature_id.cmp(&b.feature_id))
        });
        features
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Run a feature from the start and wait for it to finish.
    pub async fn execute_feature(&self, feature_id: &str) -> Result<FeatureOutcome> {
        let registration = self.register(feature_id)?;
        self.drive(registration, Some(ResumeAction::Fresh)).await
    }

    /// Resume a feature from its on-disk state and wait for it to finish.
    pub async fn resume_feature(&self, feature_id: &str) -> Result<FeatureOutcome> {
        let registration = self.register(feature_id)?;
        self.drive(registration, None).await
    }

    /// Start a feature in the background. The slot is claimed before this
    /// returns, so a second start fails immediately.
    pub fn spawn_feature(&self, feature_id: &str) -> Result<JoinHandle<Result<FeatureOutcome>>> {
        let registration = self.register(feature_id)?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            this.drive(registration, Some(ResumeAction::Fresh)).await
        }))
    }

    /// Resume a feature in the background.
    pub fn spawn_resume(&self, feature_id: &str) -> Result<JoinHandle<Result<FeatureOutcome>>> {
        let registration = self.register(feature_id)?;
        let this = self.clone();
        Ok(tokio::spawn(async move { this.drive(registration, None).await }))
    }

    /// Stop one feature. Its slot is freed at once; the run itself winds
    /// down as its agent call observes the cancellation.
    pub fn stop_feature(&self, feature_id: &str) -> bool {
        let entry = self.running().remove(feature_id);
        let Some(entry) = entry else {
            return false;
        };
        info!(feature_id, "Stopping feature");
        entry.cancel.cancel();
        self.inner.approvals.cancel(feature_id);
        self.persist_execution_state();
        true
    }

    pub fn approve_plan(
        &self,
        feature_id: &str,
        edited_plan: Option<String>,
        feedback: Option<String>,
    ) -> Result<()> {
        self.inner.approvals.approve(feature_id, edited_plan, feedback)
    }

    pub fn reject_plan(
        &self,
        feature_id: &str,
        feedback: Option<String>,
        edited_plan: Option<String>,
    ) -> Result<()> {
        self.inner.approvals.reject(feature_id, feedback, edited_plan)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.inner.approvals.pending()
    }

    /// Resolve pending approvals with decisions submitted through the
    /// approval inbox. Returns the features that were resolved.
    pub fn apply_submitted_decisions(&self) -> Result<Vec<String>> {
        let inbox = ApprovalInbox::new(&self.inner.project_root);
        let mut applied = Vec::new();
        for pending in self.pending_approvals() {
            let feature_id = pending.feature_id;
            let Some(decision) = inbox.take(&feature_id)? else {
                continue;
            };
            let result = match decision.verdict {
                Verdict::Approve => {
                    self.approve_plan(&feature_id, decision.edited_plan, decision.feedback)
                }
                Verdict::Reject => {
                    self.reject_plan(&feature_id, decision.feedback, decision.edited_plan)
                }
            };
            match result {
                Ok(()) => {
                    info!(feature_id = %feature_id, verdict = ?decision.verdict, "Applied submitted plan decision");
                    applied.push(feature_id);
                }
                Err(err) => {
                    warn!(feature_id = %feature_id, error = %err, "Failed to apply submitted plan decision");
                }
            }
        }
        Ok(applied)
    }

    /// Poll the approval inbox until the returned task is aborted.
    pub fn start_approval_inbox(&self) -> JoinHandle<()> {
        let this = self.clone();
        let period = self
            .inner
            .config
            .poll_interval()
            .max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = this.apply_submitted_decisions() {
                    warn!(error = %err, "Failed to read approval inbox");
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    async fn drive(
        &self,
        registration: Registration,
        action: Option<ResumeAction>,
    ) -> Result<FeatureOutcome> {
        let mut run_id = None;
        let result = self.run_lifecycle(&registration, action, &mut run_id).await;
        self.finalize(registration, run_id, result)
    }

    async fn run_lifecycle(
        &self,
        registration: &Registration,
        action: Option<ResumeAction>,
        run_id_slot: &mut Option<String>,
    ) -> Result<Completion> {
        let config = &self.inner.config;
        let feature = self.store().get(&registration.feature_id)?;
        let action = match action {
            Some(action) => action,
            None => recovery::action_for(
                &feature,
                self.store().read_agent_output(&feature.id)?,
                config,
            ),
        };
        let resumed = action != ResumeAction::Fresh;

        let working_dir =
            workdir::resolve_working_dir(&self.inner.project_root, &config.worktrees_dir, &feature);
        let model = feature
            .model
            .clone()
            .or_else(|| config.default_model.clone());
        let run_id = self.metrics().start_run(&feature.id);
        *run_id_slot = Some(run_id.clone());
        self.update_running(registration, |entry| {
            entry.working_dir = Some(working_dir.clone());
            entry.model = model.clone();
            entry.run_id = Some(run_id.clone());
        });

        info!(
            feature_id = %feature.id,
            action = recovery::describe(&action),
            working_dir = %working_dir.display(),
            "Starting feature"
        );
        if action == ResumeAction::Fresh {
            self.store().write_agent_output(&feature.id, "")?;
        }
        if !matches!(action, ResumeAction::RerunPipeline { .. }) {
            self.store()
                .set_status(&feature.id, FeatureStatus::InProgress)?;
        }
        self.persist_execution_state();
        self.events().emit(OrchestratorEvent::FeatureStarted {
            feature_id: feature.id.clone(),
            title: feature.title.clone(),
            model: model.clone(),
            resumed,
        });

        let session = AgentSession::new(
            Arc::clone(&self.inner.agent),
            self.store().clone(),
            self.events().clone(),
            self.metrics().clone(),
            feature.id.clone(),
            run_id,
            working_dir,
            model,
            registration.cancel.clone(),
        );
        let planner = Planner::new(&session, &self.inner.approvals, config);

        let tasks = match action {
            ResumeAction::FinishPipeline => {
                info!(feature_id = %feature.id, "Interrupted pipeline step was removed; finishing");
                return Ok(Completion::without_verification(
                    &feature,
                    "Pipeline step no longer configured; finished",
                ));
            }
            ResumeAction::RerunPipeline { step_id } => {
                let steps = pipeline::steps_from(&config.pipeline, &step_id).unwrap_or(&[]);
                pipeline::run_steps(&session, &feature, steps).await?;
                let tasks = self.current_tasks(&feature.id);
                return self.verify(&session, &feature, &tasks).await;
            }
            ResumeAction::Fresh => {
                let plan = planner.plan(&feature).await?;
                self.implement(&session, &feature, plan, None).await?
            }
            ResumeAction::RearmApproval => {
                let plan = planner.await_approval(&feature).await?;
                self.implement(&session, &feature, plan, None).await?
            }
            ResumeAction::Continue { previous_output } => {
                self.continue_implementation(&session, &planner, &feature, &previous_output)
                    .await?
            }
        };

        pipeline::run_steps(&session, &feature, &config.pipeline).await?;
        self.verify(&session, &feature, &tasks).await
    }

    async fn continue_implementation(
        &self,
        session: &AgentSession,
        planner: &Planner<'_>,
        feature: &Feature,
        previous_output: &str,
    ) -> Result<Vec<Task>> {
        let approved = feature
            .plan_spec
            .as_ref()
            .filter(|plan| plan.status == PlanStatus::Approved);
        match approved {
            Some(plan) if !plan.tasks.is_empty() => {
                let plan = self
                    .store()
                    .update_plan_spec(&feature.id, |plan| plan.reset_unfinished_tasks())?;
                info!(
                    feature_id = %feature.id,
                    completed = plan.tasks_completed,
                    total = plan.tasks_total,
                    "Resuming task plan"
                );
                let outcome = PlanOutcome {
                    content: plan.content.clone(),
                    tasks: plan.tasks.clone(),
                    feedback: plan.feedback.clone(),
                };
                self.implement(session, feature, outcome, None).await
            }
            Some(plan) => {
                let outcome = PlanOutcome {
                    content: plan.content.clone(),
                    tasks: Vec::new(),
                    feedback: plan.feedback.clone(),
                };
                self.implement(session, feature, outcome, Some(previous_output))
                    .await
            }
            // Interrupted before a plan was approved: plan again.
            None if feature.planning_mode.generates_plan() => {
                let plan = planner.plan(feature).await?;
                self.implement(session, feature, plan, None).await
            }
            None => {
                self.implement(session, feature, PlanOutcome::default(), Some(previous_output))
                    .await
            }
        }
    }

    /// Implement with the task scheduler, or with one call when the plan has
    /// no tasks.
    async fn implement(
        &self,
        session: &AgentSession,
        feature: &Feature,
        plan: PlanOutcome,
        previous_output: Option<&str>,
    ) -> Result<Vec<Task>> {
        let started = Instant::now();
        let result = if plan.tasks.is_empty() {
            let prompt = match previous_output {
                Some(previous) => {
                    prompts::continuation_prompt(feature, previous, plan.content.as_deref())
                }
                None => prompts::implementation_prompt(
                    feature,
                    plan.content.as_deref(),
                    plan.feedback.as_deref(),
                ),
            };
            session.progress("Implementing feature");
            session
                .run(prompt, Some(IMPLEMENTATION_SYSTEM_PROMPT))
                .await
                .map(|_| Vec::new())
        } else {
            self.run_tasks(session, feature, plan).await
        };
        self.metrics()
            .record_stage(session.run_id(), Stage::Execution, started.elapsed());
        result
    }

    async fn run_tasks(
        &self,
        session: &AgentSession,
        feature: &Feature,
        plan: PlanOutcome,
    ) -> Result<Vec<Task>> {
        let executor = Arc::new(PlanTaskExecutor {
            session: session.clone(),
            feature: feature.clone(),
            plan: plan.content.clone().unwrap_or_default(),
        });
        let store = self.store();
        let events = self.events();
        let feature_id = feature.id.as_str();

        self.inner
            .scheduler
            .run(
                plan.tasks,
                executor,
                session.cancel_token(),
                |tasks, update| {
                    let persisted = store.update_plan_spec(feature_id, |plan| {
                        plan.tasks = tasks.to_vec();
                        plan.refresh_summary();
                    });
                    if let Err(err) = persisted {
                        warn!(feature_id, error = %err, "Failed to persist task progress");
                    }

                    let completed = tasks
                        .iter()
                        .filter(|task| task.status == TaskStatus::Completed)
                        .count();
                    let total = tasks.len();
                    match update {
                        SchedulerUpdate::TaskStarted { task_id } => {
                            let description = tasks
                                .iter()
                                .find(|task| &task.id == task_id)
                                .map(|task| task.description.clone())
                                .unwrap_or_default();
                            events.emit(OrchestratorEvent::TaskStarted {
                                feature_id: feature_id.to_string(),
                                task_id: task_id.clone(),
                                description,
                                completed,
                                total,
                            });
                        }
                        SchedulerUpdate::TaskFinished { task_id, success } => {
                            events.emit(OrchestratorEvent::TaskComplete {
                                feature_id: feature_id.to_string(),
                                task_id: task_id.clone(),
                                success: *success,
                                completed,
                                total,
                            });
                        }
                        SchedulerUpdate::PhaseComplete { phase } => {
                            events.emit(OrchestratorEvent::PhaseComplete {
                                feature_id: feature_id.to_string(),
                                phase: phase.clone(),
                            });
                        }
                        SchedulerUpdate::TasksBlocked { task_ids } => {
                            warn!(feature_id, task_ids = ?task_ids, "Tasks blocked");
                        }
                    }
                },
            )
            .await
    }

    async fn verify(
        &self,
        session: &AgentSession,
        feature: &Feature,
        tasks: &[Task],
    ) -> Result<Completion> {
        let outcome = Verifier::new(session, &self.inner.config)
            .verify(feature, tasks)
            .await?;
        Ok(Completion::from_verification(feature, &outcome))
    }

    fn current_tasks(&self, feature_id: &str) -> Vec<Task> {
        self.store()
            .load(feature_id)
            .ok()
            .flatten()
            .and_then(|feature| feature.plan_spec)
            .map(|plan| plan.tasks)
            .unwrap_or_default()
    }

    /// Record the end of a run. Always releases the slot, closes metrics
    /// and cancels any approval waiter.
    fn finalize(
        &self,
        registration: Registration,
        run_id: Option<String>,
        result: Result<Completion>,
    ) -> Result<FeatureOutcome> {
        let feature_id = registration.feature_id.clone();
        self.inner.approvals.cancel(&feature_id);
        self.unregister(&registration);

        let (outcome, failure, error_message) = match result {
            Ok(completion) => {
                if let Err(err) = self.store().set_status(&feature_id, completion.status.clone()) {
                    warn!(feature_id = %feature_id, error = %err, "Failed to save final status");
                }
                info!(
                    feature_id = %feature_id,
                    status = %completion.status,
                    passed = completion.passed,
                    "Feature finished"
                );
                self.events().emit(OrchestratorEvent::FeatureComplete {
                    feature_id: feature_id.clone(),
                    passes: completion.passed,
                    message: completion.message.clone(),
                });
                let failure = (!completion.passed).then_some(ErrorCategory::Fatal);
                let error_message = (!completion.passed).then(|| completion.message.clone());
                let outcome = FeatureOutcome {
                    feature_id: feature_id.clone(),
                    status: completion.status,
                    passed: completion.passed,
                    message: completion.message,
                };
                (Ok(outcome), failure, error_message)
            }
            Err(err) if err.is_cancellation() => {
                if matches!(err, OrchestratorError::PlanRejected(_)) {
                    if let Err(store_err) = self.store().set_status(&feature_id, FeatureStatus::Backlog) {
                        warn!(feature_id = %feature_id, error = %store_err, "Failed to reset status");
                    }
                }
                info!(feature_id = %feature_id, reason = %err, "Feature stopped");
                let message = err.to_string();
                self.events().emit(OrchestratorEvent::FeatureComplete {
                    feature_id: feature_id.clone(),
                    passes: false,
                    message: message.clone(),
                });
                (Err(err), None, Some(message))
            }
            Err(err) => {
                let category = err.classify();
                error!(
                    feature_id = %feature_id,
                    category = category.label(),
                    error = %err,
                    "Feature failed"
                );
                let message = err.to_string();
                if let Err(store_err) = self.store().mark_failed(&feature_id, &message) {
                    warn!(feature_id = %feature_id, error = %store_err, "Failed to record failure");
                }
                self.events().emit(OrchestratorEvent::FeatureError {
                    feature_id: feature_id.clone(),
                    error: message.clone(),
                    category: category.label().to_string(),
                });
                (Err(err), Some(category), Some(message))
            }
        };

        if let Some(run_id) = run_id {
            let success = outcome.as_ref().is_ok_and(|outcome| outcome.passed);
            if let Some(run) = self.metrics().finish(&run_id, success, error_message) {
                self.events().emit(OrchestratorEvent::MetricsUpdated {
                    feature_id: feature_id.clone(),
                    run_id: run.run_id.clone(),
                    status: run.status.as_str().to_string(),
                });
            }
        }

        let cancelled = outcome.as_ref().is_err_and(|err| err.is_cancellation());
        if !cancelled {
            self.record_feature_result(failure);
        }
        self.persist_execution_state();
        outcome
    }

    /// Rewrite the execution-state snapshot while the auto-loop runs.
    pub(crate) fn persist_execution_state(&self) {
        let Some(max_concurrency) = self.auto_loop_capacity() else {
            return;
        };
        let state = ExecutionState::new(
            true,
            max_concurrency,
            self.running_ids().into_iter().collect(),
        );
        if let Err(err) = self.state_store().save(&state) {
            warn!(error = %err, "Failed to save execution state");
        }
    }
}

/// Runs one plan task as a task-scoped agent call.
struct PlanTaskExecutor {
    session: AgentSession,
    feature: Feature,
    plan: String,
}

#[async_trait]
impl TaskExecutor for PlanTaskExecutor {
    async fn execute_task(&self, task: Task, tasks: Vec<Task>) -> Result<()> {
        let prompt = prompts::task_prompt(&self.feature, &self.plan, &task, &tasks);
        self.session
            .run(prompt, Some(IMPLEMENTATION_SYSTEM_PROMPT))
            .await
            .map(|_| ())
    }
}
