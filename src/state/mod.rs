//! Execution-state snapshot for crash recovery.
//!
//! While the auto-loop runs, a small snapshot is rewritten after every
//! meaningful transition. An explicit stop deletes it, so a snapshot found
//! at startup means the previous process did not shut down cleanly.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::state_dir;
use crate::error::Result;
use crate::persist::{read_json, remove_if_exists, write_json};

const STATE_FILE_NAME: &str = "execution-state.json";

/// Durable snapshot of in-flight work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub auto_loop_active: bool,
    pub max_concurrency: usize,
    /// Features believed running when the snapshot was taken, sorted.
    pub running_feature_ids: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(auto_loop_active: bool, max_concurrency: usize, mut running: Vec<String>) -> Self {
        running.sort();
        running.dedup();
        Self {
            auto_loop_active,
            max_concurrency,
            running_feature_ids: running,
            saved_at: Utc::now(),
        }
    }
}

/// File-backed store for the snapshot.
#[derive(Debug, Clone)]
pub struct ExecutionStateStore {
    path: PathBuf,
}

impl ExecutionStateStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            path: state_dir(project_root).join(STATE_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &ExecutionState) -> Result<()> {
        debug!(
            auto_loop_active = state.auto_loop_active,
            running = state.running_feature_ids.len(),
            "Saving execution state"
        );
        write_json(&self.path, state)
    }

    pub fn load(&self) -> Result<Option<ExecutionState>> {
        read_json(&self.path)
    }

    /// Remove the snapshot; used on explicit user stop.
    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path)?;
        Ok(())
    }
}
