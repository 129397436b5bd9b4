//! Orchestrator configuration.
//!
//! Settings are read from `.featureloop/config.toml` under the project root
//! and may be overridden with `FEATURELOOP__*` environment variables
//! (double underscore separates nested keys).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Directory under the project root holding all orchestrator state.
pub const STATE_DIR_NAME: &str = ".featureloop";

/// File name of the optional configuration file.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "FEATURELOOP";

/// Default sentinel the planning agent emits once its plan is complete.
pub const DEFAULT_PLAN_MARKER: &str = "[PLAN_GENERATED]";

/// Bounds for the per-feature task concurrency cap.
pub const MIN_TASK_CONCURRENCY: usize = 1;
pub const MAX_TASK_CONCURRENCY: usize = 8;

/// Bounds for the auto-loop feature concurrency cap.
pub const MAX_FEATURE_CONCURRENCY: usize = 10;

/// A single verification command run by the quality gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCommand {
    /// Check name reported in results (e.g. "lint", "typecheck").
    pub name: String,
    /// Shell command executed in the feature's working directory.
    pub command: String,
}

impl GateCommand {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// A configured post-implementation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub order: u32,
    pub instructions: String,
}

/// How to launch the subprocess agent client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    /// Executable to run.
    pub program: String,
    /// Arguments placed before the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag used to pass the model, if any (e.g. "--model").
    #[serde(default)]
    pub model_flag: Option<String>,
    /// Flag used to pass a system prompt, if any.
    #[serde(default)]
    pub system_prompt_flag: Option<String>,
    /// Extra arguments for read-only calls such as the judge.
    #[serde(default)]
    pub read_only_args: Vec<String>,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            model_flag: Some("--model".to_string()),
            system_prompt_flag: Some("--append-system-prompt".to_string()),
            read_only_args: vec!["--permission-mode".to_string(), "plan".to_string()],
        }
    }
}

/// Top-level orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Features allowed in flight at once under the auto-loop.
    pub max_concurrency: usize,
    /// Tasks allowed in flight at once within one feature.
    pub task_concurrency: usize,
    /// Model used when a feature has no override.
    pub default_model: Option<String>,
    /// Automatic plan-quality revision requests before giving up.
    pub max_plan_revisions: u32,
    /// Fix attempts after a failed quality gate.
    pub max_quality_fix_attempts: u32,
    /// Revision attempts after a "revise" judge verdict.
    pub max_judge_attempts: u32,
    /// Hard timeout for a pending plan approval.
    pub approval_timeout_secs: u64,
    /// Timeout for each quality gate command.
    pub gate_timeout_secs: u64,
    /// Ordered verification commands.
    pub quality_gates: Vec<GateCommand>,
    /// Whether the read-only judge pass runs after green gates.
    pub judge_enabled: bool,
    /// Post-implementation pipeline steps.
    pub pipeline: Vec<PipelineStep>,
    /// Failures within the window that pause the auto-loop.
    pub failure_threshold: u32,
    /// Rolling window for counting failures.
    pub failure_window_secs: u64,
    /// Auto-loop poll interval when idle or at capacity.
    pub poll_interval_ms: u64,
    /// Only `verified` dependencies unblock a feature when set.
    pub require_verified_dependencies: bool,
    /// Sub-planning trigger: task count above this.
    pub subplan_max_tasks: usize,
    /// Sub-planning trigger: weighted complexity above this.
    pub subplan_max_weight: u32,
    /// Sub-planning trigger: at least this many high-complexity tasks.
    pub subplan_high_tasks: usize,
    /// Number of metrics runs kept in history.
    pub metrics_history_limit: usize,
    /// Sentinel marking the end of the generated plan.
    pub plan_marker: String,
    /// Directory (relative to the project root) holding per-branch worktrees.
    pub worktrees_dir: PathBuf,
    /// Treat every plan as auto-approved.
    pub auto_approve_plans: bool,
    /// Subprocess agent settings.
    pub agent: AgentCommandConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            task_concurrency: 3,
            default_model: None,
            max_plan_revisions: 2,
            max_quality_fix_attempts: 2,
            max_judge_attempts: 2,
            approval_timeout_secs: 30 * 60,
            gate_timeout_secs: 600,
            quality_gates: Vec::new(),
            judge_enabled: true,
            pipeline: Vec::new(),
            failure_threshold: 3,
            failure_window_secs: 60,
            poll_interval_ms: 2000,
            require_verified_dependencies: false,
            subplan_max_tasks: 10,
            subplan_max_weight: 20,
            subplan_high_tasks: 2,
            metrics_history_limit: 200,
            plan_marker: DEFAULT_PLAN_MARKER.to_string(),
            worktrees_dir: PathBuf::from(".worktrees"),
            auto_approve_plans: false,
            agent: AgentCommandConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration for a project, layering file and environment.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = config_path(project_root);
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: OrchestratorConfig = settings.try_deserialize()?;
        Ok(config.normalized())
    }

    /// Clamp caps into their supported ranges and order the pipeline.
    pub fn normalized(mut self) -> Self {
        self.task_concurrency = clamp_task_concurrency(self.task_concurrency);
        self.max_concurrency = self.max_concurrency.clamp(1, MAX_FEATURE_CONCURRENCY);
        self.pipeline.sort_by_key(|step| step.order);
        self
    }

    /// Render the config as TOML, for `featureloop init`.
    pub fn to_toml(&self) -> std::result::Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Sets the auto-loop feature cap.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.clamp(1, MAX_FEATURE_CONCURRENCY);
        self
    }

    /// Sets the per-feature task cap (clamped to 1..=8).
    pub fn with_task_concurrency(mut self, max: usize) -> Self {
        self.task_concurrency = clamp_task_concurrency(max);
        self
    }

    pub fn with_quality_gates(mut self, gates: Vec<GateCommand>) -> Self {
        self.quality_gates = gates;
        self
    }

    pub fn with_pipeline(mut self, mut steps: Vec<PipelineStep>) -> Self {
        steps.sort_by_key(|step| step.order);
        self.pipeline = steps;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_judge_enabled(mut self, enabled: bool) -> Self {
        self.judge_enabled = enabled;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_auto_approve_plans(mut self, auto_approve: bool) -> Self {
        self.auto_approve_plans = auto_approve;
        self
    }
}

/// Clamp a task concurrency request into 1..=8.
pub fn clamp_task_concurrency(requested: usize) -> usize {
    requested.clamp(MIN_TASK_CONCURRENCY, MAX_TASK_CONCURRENCY)
}

/// Path to the state directory for a project.
pub fn state_dir(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR_NAME)
}

/// Path to the config file for a project.
pub fn config_path(project_root: &Path) -> PathBuf {
    state_dir(project_root).join(CONFIG_FILE_NAME)
}
