//! Feature, plan and task data model.
//!
//! A [`Feature`] is the unit of work driven through the lifecycle. Once
//! planning starts it carries an embedded [`PlanSpec`] with the parsed
//! [`Task`] list and live progress counters.

pub mod store;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::{versioned_update, FeatureStore, Versioned, VersionedWrite};

/// Prefix used to encode an in-progress pipeline step in the status field.
pub const PIPELINE_STATUS_PREFIX: &str = "pipeline_";

/// Lifecycle status of a feature.
///
/// Serialized as a plain string; pipeline steps are encoded as
/// `pipeline_<step id>` so external viewers can show step progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum FeatureStatus {
    Backlog,
    Pending,
    Ready,
    InProgress,
    /// Running the pipeline step with this id.
    Pipeline(String),
    /// Finished; a human has to review the result.
    WaitingApproval,
    /// Finished with green gates and judge.
    Verified,
}

impl FeatureStatus {
    /// Whether the auto-loop may pick this feature up.
    pub fn is_startable(&self) -> bool {
        matches!(
            self,
            FeatureStatus::Backlog | FeatureStatus::Pending | FeatureStatus::Ready
        )
    }

    /// Whether the status looks like work was in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, FeatureStatus::InProgress | FeatureStatus::Pipeline(_))
    }

    /// Terminal success boundary of the orchestrator.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            FeatureStatus::WaitingApproval | FeatureStatus::Verified
        )
    }

    /// Pipeline step id, if the status encodes one.
    pub fn pipeline_step(&self) -> Option<&str> {
        match self {
            FeatureStatus::Pipeline(step) => Some(step),
            _ => None,
        }
    }

    pub fn as_label(&self) -> String {
        match self {
            FeatureStatus::Backlog => "backlog".to_string(),
            FeatureStatus::Pending => "pending".to_string(),
            FeatureStatus::Ready => "ready".to_string(),
            FeatureStatus::InProgress => "in_progress".to_string(),
            FeatureStatus::Pipeline(step) => format!("{}{}", PIPELINE_STATUS_PREFIX, step),
            FeatureStatus::WaitingApproval => "waiting_approval".to_string(),
            FeatureStatus::Verified => "verified".to_string(),
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_label())
    }
}

impl From<FeatureStatus> for String {
    fn from(status: FeatureStatus) -> Self {
        status.as_label()
    }
}

impl FromStr for FeatureStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "backlog" => Ok(FeatureStatus::Backlog),
            "pending" => Ok(FeatureStatus::Pending),
            "ready" => Ok(FeatureStatus::Ready),
            "in_progress" => Ok(FeatureStatus::InProgress),
            "waiting_approval" => Ok(FeatureStatus::WaitingApproval),
            "verified" => Ok(FeatureStatus::Verified),
            other => match other.strip_prefix(PIPELINE_STATUS_PREFIX) {
                Some(step) if !step.is_empty() => Ok(FeatureStatus::Pipeline(step.to_string())),
                _ => Err(format!("unknown feature status: {}", other)),
            },
        }
    }
}

impl TryFrom<String> for FeatureStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Planning mode selected per feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningMode {
    /// No plan; implement directly.
    #[default]
    Skip,
    Lite,
    LiteWithApproval,
    Spec,
    Full,
}

impl PlanningMode {
    /// Whether a plan is generated at all.
    pub fn generates_plan(&self) -> bool {
        !matches!(self, PlanningMode::Skip)
    }

    /// Whether the plan produced in this mode may be held for approval.
    pub fn supports_approval(&self) -> bool {
        matches!(
            self,
            PlanningMode::LiteWithApproval | PlanningMode::Spec | PlanningMode::Full
        )
    }

    /// Whether the lightweight section checklist applies.
    pub fn is_lite(&self) -> bool {
        matches!(self, PlanningMode::Lite | PlanningMode::LiteWithApproval)
    }
}

/// Status of a feature's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Generating,
    Generated,
    Approved,
    Rejected,
}

/// Complexity bucket for a task or a whole run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl Complexity {
    /// Weight used by the sub-planning threshold.
    pub fn weight(&self) -> u32 {
        match self {
            Complexity::Low => 1,
            Complexity::Medium => 2,
            Complexity::High => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }

    /// Parse a complexity label leniently; unknown labels are medium.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" | "simple" | "small" => Complexity::Low,
            "high" | "complex" | "large" => Complexity::High,
            _ => Complexity::Medium,
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
    Failed,
}

/// One unit of implementation work parsed from a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            file_path: None,
            phase: None,
            depends_on: Vec::new(),
            complexity: Complexity::default(),
            status: TaskStatus::Pending,
        }
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    /// One-line summary used in task prompts.
    pub fn summary_line(&self) -> String {
        match &self.file_path {
            Some(path) => format!("{}: {} ({})", self.id, self.description, path),
            None => format!("{}: {}", self.id, self.description),
        }
    }
}

/// Plan attached to a feature once planning starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSpec {
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub tasks_total: usize,
    #[serde(default)]
    pub tasks_completed: usize,
    #[serde(default)]
    pub current_task_ids: Vec<String>,
    /// Bumped on every persisted write; used for lost-update detection.
    #[serde(default)]
    pub task_state_version: u64,
    #[serde(default)]
    pub quality_issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reviewed_by_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl Default for PlanSpec {
    fn default() -> Self {
        Self {
            status: PlanStatus::Pending,
            content: None,
            version: 0,
            tasks: Vec::new(),
            tasks_total: 0,
            tasks_completed: 0,
            current_task_ids: Vec::new(),
            task_state_version: 0,
            quality_issues: Vec::new(),
            generated_at: None,
            approved_at: None,
            reviewed_by_user: false,
            feedback: None,
        }
    }
}

impl PlanSpec {
    /// Replace the plan content and tasks, bumping the content version.
    pub fn replace_content(&mut self, content: impl Into<String>, tasks: Vec<Task>) {
        self.content = Some(content.into());
        self.version += 1;
        self.tasks = tasks;
        self.generated_at = Some(Utc::now());
        self.refresh_summary();
    }

    /// Recompute counters and in-flight ids from the task list.
    pub fn refresh_summary(&mut self) {
        self.tasks_total = self.tasks.len();
        self.tasks_completed = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Completed)
            .count();
        self.current_task_ids = self
            .tasks
            .iter()
            .filter(|task| task.status == TaskStatus::InProgress)
            .map(|task| task.id.clone())
            .collect();
    }

    /// Whether any task has been completed in a previous run.
    pub fn has_progress(&self) -> bool {
        self.tasks
            .iter()
            .any(|task| task.status == TaskStatus::Completed)
    }

    /// Reset interrupted tasks so a resumed run picks them up again.
    ///
    /// Completed tasks stay completed.
    pub fn reset_unfinished_tasks(&mut self) {
        for task in &mut self.tasks {
            if task.status != TaskStatus::Completed {
                task.status = TaskStatus::Pending;
            }
        }
        self.refresh_summary();
    }
}

impl Versioned for PlanSpec {
    fn version(&self) -> u64 {
        self.task_state_version
    }

    fn set_version(&mut self, version: u64) {
        self.task_state_version = version;
    }
}

/// A feature tracked through the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: FeatureStatus,
    #[serde(default)]
    pub planning_mode: PlanningMode,
    #[serde(default)]
    pub require_plan_approval: bool,
    #[serde(default)]
    pub skip_tests: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_spec: Option<PlanSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Feature {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: FeatureStatus::Backlog,
            planning_mode: PlanningMode::Skip,
            require_plan_approval: false,
            skip_tests: false,
            branch_name: None,
            model: None,
            dependencies: Vec::new(),
            plan_spec: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_status(mut self, status: FeatureStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_planning_mode(mut self, mode: PlanningMode) -> Self {
        self.planning_mode = mode;
        self
    }

    pub fn with_plan_approval(mut self, required: bool) -> Self {
        self.require_plan_approval = required;
        self
    }

    pub fn with_skip_tests(mut self, skip: bool) -> Self {
        self.skip_tests = skip;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch_name = Some(branch.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_plan_spec(mut self, plan: PlanSpec) -> Self {
        self.plan_spec = Some(plan);
        self
    }

    /// Whether implementation must wait for a human to approve the plan.
    pub fn needs_plan_approval(&self) -> bool {
        self.require_plan_approval && self.planning_mode.supports_approval()
    }

    /// Prompt describing the feature to the agent.
    pub fn prompt_text(&self) -> String {
        if self.description.trim().is_empty() {
            format!("# {}\n", self.title)
        } else {
            format!("# {}\n\n{}\n", self.title, self.description.trim())
        }
    }
}
