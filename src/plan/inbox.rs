//! Approval decisions handed over through the filesystem.
//!
//! Waiters live in the process running the feature, so another process
//! (the `approve`/`reject` commands) drops a decision file under
//! `.featureloop/approvals/<feature-id>.json`. The running process picks it
//! up on its next poll and resolves the waiter with it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::state_dir;
use crate::error::{OrchestratorError, Result};
use crate::persist::{read_json, remove_if_exists, write_json};

const APPROVALS_DIR_NAME: &str = "approvals";

/// Approve or reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

/// A decision waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedDecision {
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl SubmittedDecision {
    pub fn approve(edited_plan: Option<String>, feedback: Option<String>) -> Self {
        Self {
            verdict: Verdict::Approve,
            edited_plan,
            feedback,
            submitted_at: Utc::now(),
        }
    }

    pub fn reject(feedback: Option<String>, edited_plan: Option<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            edited_plan,
            feedback,
            submitted_at: Utc::now(),
        }
    }
}

/// Directory of submitted decisions, one file per feature.
#[derive(Debug, Clone)]
pub struct ApprovalInbox {
    dir: PathBuf,
}

impl ApprovalInbox {
    pub fn new(project_root: &Path) -> Self {
        Self {
            dir: state_dir(project_root).join(APPROVALS_DIR_NAME),
        }
    }

    /// Store a decision, replacing any earlier one for the feature.
    pub fn submit(&self, feature_id: &str, decision: &SubmittedDecision) -> Result<()> {
        let path = self.path(feature_id)?;
        debug!(feature_id, verdict = ?decision.verdict, "Submitting plan decision");
        write_json(&path, decision)
    }

    /// Read the feature's decision without consuming it.
    pub fn peek(&self, feature_id: &str) -> Result<Option<SubmittedDecision>> {
        read_json(&self.path(feature_id)?)
    }

    /// Read and remove the feature's decision.
    pub fn take(&self, feature_id: &str) -> Result<Option<SubmittedDecision>> {
        let path = self.path(feature_id)?;
        let decision = read_json(&path)?;
        if decision.is_some() {
            remove_if_exists(&path)?;
        }
        Ok(decision)
    }

    /// Drop any decision left for the feature.
    pub fn discard(&self, feature_id: &str) -> Result<()> {
        remove_if_exists(&self.path(feature_id)?)?;
        Ok(())
    }

    fn path(&self, feature_id: &str) -> Result<PathBuf> {
        if feature_id.trim().is_empty() || feature_id.contains(['/', '\\']) || feature_id == ".." {
            return Err(OrchestratorError::FeatureNotFound(feature_id.to_string()));
        }
        fs::create_dir_all(&self.dir)?;
        Ok(self.dir.join(format!("{}.json", feature_id)))
    }
}
