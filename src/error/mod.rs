//! Error types for feature orchestration.

pub mod classification;

use std::io;

use thiserror::Error;

pub use classification::{classify_message, ErrorCategory};

/// Errors that can occur while orchestrating a feature.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The feature already has a live run.
    #[error("Feature {0} is already running")]
    AlreadyRunning(String),

    /// No feature record exists for the id.
    #[error("Feature not found: {0}")]
    FeatureNotFound(String),

    /// The id cannot be used as a storage key.
    #[error("Invalid feature id: {0:?}")]
    InvalidFeatureId(String),

    /// The run was stopped through its cancellation token.
    #[error("Stopped by user")]
    Cancelled,

    /// The plan was rejected without feedback or edits.
    #[error("Plan rejected for feature {0}")]
    PlanRejected(String),

    /// A second approval waiter was requested for the same feature.
    #[error("Feature {0} already has a pending plan approval")]
    ApprovalPending(String),

    /// Approve/reject was called with nothing waiting.
    #[error("No pending plan approval for feature {0}")]
    NoPendingApproval(String),

    /// Nobody answered the approval request in time.
    #[error("Plan approval timed out for feature {0}")]
    ApprovalTimedOut(String),

    /// The agent reported an error or a failed result.
    #[error("Agent error: {message}")]
    Agent {
        message: String,
        category: ErrorCategory,
    },

    /// The planning call produced nothing usable.
    #[error("Plan generation failed: {0}")]
    PlanGenerationFailed(String),

    /// A scheduled task failed; remaining tasks were blocked.
    #[error("Task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    /// The task graph stalled with pending tasks and nothing runnable.
    #[error("Dependency cycle detected among tasks: {}", task_ids.join(", "))]
    DependencyCycle { task_ids: Vec<String> },

    /// Tasks referenced dependency ids that do not exist in the plan.
    #[error("Unresolvable task dependencies: {}", task_ids.join(", "))]
    UnresolvableDependencies { task_ids: Vec<String> },

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Build an agent error, classifying the message.
    pub fn agent(message: impl Into<String>) -> Self {
        let message = message.into();
        let category = classify_message(&message);
        OrchestratorError::Agent { message, category }
    }

    /// Map the error to its failure category.
    pub fn classify(&self) -> ErrorCategory {
        match self {
            OrchestratorError::Cancelled | OrchestratorError::PlanRejected(_) => {
                ErrorCategory::Cancelled
            }
            OrchestratorError::Agent { category, .. } => *category,
            OrchestratorError::TaskFailed { message, .. } => classify_message(message),
            OrchestratorError::ApprovalTimedOut(_) => ErrorCategory::Timeout,
            OrchestratorError::Io(_) => ErrorCategory::Transient,
            _ => ErrorCategory::Fatal,
        }
    }

    /// Whether this is a user-initiated stop rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        self.classify() == ErrorCategory::Cancelled
    }
}
