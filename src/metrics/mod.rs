//! Execution metrics.
//!
//! One [`MetricsRun`] is opened when a feature starts and closed when it
//! ends. Stage durations accumulate across retries, so a feature that needed
//! two fix attempts accrues verification time from both. Every update is
//! persisted to a capped history and the rolling aggregates are recomputed.

pub mod tokens;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::state_dir;
use crate::error::Result;
use crate::events::CheckSummary;
use crate::feature::{Complexity, Task};
use crate::persist::{read_json, write_json};

pub use tokens::{TokenCount, TokenEstimator};

const METRICS_DIR_NAME: &str = "metrics";
const HISTORY_FILE_NAME: &str = "history.json";
const AGGREGATES_FILE_NAME: &str = "aggregates.json";

/// Lifecycle stage a duration is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Execution,
    Pipeline,
    Verification,
    Judge,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Planning,
        Stage::Execution,
        Stage::Pipeline,
        Stage::Verification,
        Stage::Judge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Planning => "planning",
            Stage::Execution => "execution",
            Stage::Pipeline => "pipeline",
            Stage::Verification => "verification",
            Stage::Judge => "judge",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }
}

/// One feature execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRun {
    pub run_id: String,
    pub feature_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Accumulated milliseconds per stage.
    #[serde(default)]
    pub stage_durations_ms: BTreeMap<Stage, u64>,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub plan_revisions: u32,
    #[serde(default)]
    pub quality_attempts: u32,
    #[serde(default)]
    pub judge_attempts: u32,
    #[serde(default)]
    pub tasks_total: usize,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub quality_checks: Vec<CheckSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_verdict: Option<String>,
    #[serde(default)]
    pub tokens: TokenCount,
    #[serde(default)]
    pub token_efficiency: f64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricsRun {
    pub fn new(run_id: impl Into<String>, feature_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            feature_id: feature_id.into(),
            started_at: Utc::now(),
            completed_at: None,
            stage_durations_ms: BTreeMap::new(),
            total_duration_ms: 0,
            plan_revisions: 0,
            quality_attempts: 0,
            judge_attempts: 0,
            tasks_total: 0,
            complexity: Complexity::default(),
            quality_checks: Vec::new(),
            judge_verdict: None,
            tokens: TokenCount::default(),
            token_efficiency: 0.0,
            status: RunStatus::Running,
            error: None,
        }
    }

    pub fn stage_duration(&self, stage: Stage) -> Duration {
        Duration::from_millis(self.stage_durations_ms.get(&stage).copied().unwrap_or(0))
    }

    /// Revision cycles beyond the first attempt of each loop.
    pub fn revisions(&self) -> u32 {
        self.plan_revisions
            + self.quality_attempts.saturating_sub(1)
            + self.judge_attempts.saturating_sub(1)
    }
}

/// Complexity bucket for a task list, by mean task weight.
pub fn complexity_bucket(tasks: &[Task]) -> Complexity {
    if tasks.is_empty() {
        return Complexity::Medium;
    }
    let weight: u32 = tasks.iter().map(|task| task.complexity.weight()).sum();
    let mean = weight as f64 / tasks.len() as f64;
    if mean < 1.5 && tasks.len() <= 3 {
        Complexity::Low
    } else if mean >= 2.5 || tasks.len() > 10 {
        Complexity::High
    } else {
        Complexity::Medium
    }
}

/// Duration statistics for a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u32,
    pub mean_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub total_ms: u64,
}

impl DurationStats {
    /// Add a new duration sample.
    pub fn add_sample(&mut self, millis: u64) {
        self.count += 1;
        self.total_ms += millis;
        self.mean_ms = self.total_ms / self.count as u64;

        if self.count == 1 {
            self.min_ms = millis;
            self.max_ms = millis;
        } else {
            self.min_ms = self.min_ms.min(millis);
            self.max_ms = self.max_ms.max(millis);
        }
    }
}

/// Rolling aggregates over the stored history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsAggregates {
    pub total_runs: u32,
    pub successful_runs: u32,
    pub failed_runs: u32,
    pub running_runs: u32,
    pub success_rate: f64,
    pub mean_revisions: f64,
    pub mean_duration_ms: u64,
    pub mean_duration_by_complexity: BTreeMap<Complexity, u64>,
    pub stage_stats: BTreeMap<Stage, DurationStats>,
    /// Busy time over available slot time across the history window.
    pub concurrency_utilization: f64,
    /// Stage with the highest mean duration.
    pub bottleneck: Option<Stage>,
    pub mean_token_efficiency: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MetricsAggregates {
    /// Recompute from history; only finished runs count.
    pub fn compute(history: &[MetricsRun], max_concurrency: usize) -> Self {
        let running_runs = history
            .iter()
            .filter(|run| run.status == RunStatus::Running)
            .count() as u32;
        let finished: Vec<&MetricsRun> = history
            .iter()
            .filter(|run| run.status != RunStatus::Running)
            .collect();
        let total = finished.len();
        if total == 0 {
            return Self {
                running_runs,
                updated_at: Some(Utc::now()),
                ..Self::default()
            };
        }

        let successful = finished
            .iter()
            .filter(|run| run.status == RunStatus::Success)
            .count();
        let revisions: u32 = finished.iter().map(|run| run.revisions()).sum();
        let total_duration: u64 = finished.iter().map(|run| run.total_duration_ms).sum();
        let efficiency: f64 = finished.iter().map(|run| run.token_efficiency).sum();

        let mut by_complexity: HashMap<Complexity, DurationStats> = HashMap::new();
        let mut stage_stats: BTreeMap<Stage, DurationStats> = BTreeMap::new();
        for run in &finished {
            by_complexity
                .entry(run.complexity)
                .or_default()
                .add_sample(run.total_duration_ms);
            for (stage, millis) in &run.stage_durations_ms {
                stage_stats.entry(*stage).or_default().add_sample(*millis);
            }
        }

        let bottleneck = stage_stats
            .iter()
            .filter(|(_, stats)| stats.mean_ms > 0)
            .max_by_key(|(_, stats)| stats.mean_ms)
            .map(|(stage, _)| *stage);

        Self {
            total_runs: total as u32,
            successful_runs: successful as u32,
            failed_runs: (total - successful) as u32,
            running_runs,
            success_rate: successful as f64 / total as f64,
            mean_revisions: revisions as f64 / total as f64,
            mean_duration_ms: total_duration / total as u64,
            mean_duration_by_complexity: by_complexity
                .into_iter()
                .map(|(complexity, stats)| (complexity, stats.mean_ms))
                .collect(),
            stage_stats,
            concurrency_utilization: utilization(&finished, max_concurrency),
            bottleneck,
            mean_token_efficiency: efficiency / total as f64,
            updated_at: Some(Utc::now()),
        }
    }
}

fn utilization(runs: &[&MetricsRun], max_concurrency: usize) -> f64 {
    let start = runs.iter().map(|run| run.started_at).min();
    let end = runs.iter().filter_map(|run| run.completed_at).max();
    let (Some(start), Some(end)) = (start, end) else {
        return 0.0;
    };
    let window_ms = (end - start).num_milliseconds().max(1) as f64;
    let busy_ms: u64 = runs.iter().map(|run| run.total_duration_ms).sum();
    (busy_ms as f64 / (window_ms * max_concurrency.max(1) as f64)).clamp(0.0, 1.0)
}

/// On-disk history and aggregates.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    dir: PathBuf,
    history_limit: usize,
}

impl MetricsStore {
    pub fn new(project_root: &Path, history_limit: usize) -> Self {
        Self {
            dir: state_dir(project_root).join(METRICS_DIR_NAME),
            history_limit: history_limit.max(1),
        }
    }

    pub fn load_history(&self) -> Result<Vec<MetricsRun>> {
        Ok(read_json(&self.dir.join(HISTORY_FILE_NAME))?.unwrap_or_default())
    }

    pub fn load_aggregates(&self) -> Result<Option<MetricsAggregates>> {
        read_json(&self.dir.join(AGGREGATES_FILE_NAME))
    }

    /// Insert or replace a run, trim the history and rewrite aggregates.
    pub fn upsert(&self, run: &MetricsRun, max_concurrency: usize) -> Result<MetricsAggregates> {
        let mut history = self.load_history()?;
        match history.iter_mut().find(|existing| existing.run_id == run.run_id) {
            Some(existing) => *existing = run.clone(),
            None => history.push(run.clone()),
        }
        if history.len() > self.history_limit {
            let excess = history.len() - self.history_limit;
            history.drain(..excess);
        }
        let aggregates = MetricsAggregates::compute(&history, max_concurrency);
        write_json(&self.dir.join(HISTORY_FILE_NAME), &history)?;
        write_json(&self.dir.join(AGGREGATES_FILE_NAME), &aggregates)?;
        Ok(aggregates)
    }
}

/// Thread-safe collector for open runs.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    store: MetricsStore,
    max_concurrency: usize,
    open: Arc<Mutex<HashMap<String, MetricsRun>>>,
}

impl MetricsCollector {
    pub fn new(store: MetricsStore, max_concurrency: usize) -> Self {
        Self {
            store,
            max_concurrency,
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    /// Generate a run ID using timestamp and process ID.
    pub fn generate_run_id() -> String {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let pid = std::process::id();
        format!("run-{}-{}", millis, pid)
    }

    /// Open a run for a feature and return its id.
    pub fn start_run(&self, feature_id: &str) -> String {
        let run_id = format!("{}-{}", Self::generate_run_id(), feature_id);
        let run = MetricsRun::new(&run_id, feature_id);
        debug!(feature_id, run_id = %run_id, "Opened metrics run");
        self.with_open(|open| {
            self.persist(&run);
            open.insert(run_id.clone(), run);
        });
        run_id
    }

    /// Add time to a stage.
    pub fn record_stage(&self, run_id: &str, stage: Stage, duration: Duration) {
        self.update(run_id, |run| {
            *run.stage_durations_ms.entry(stage).or_insert(0) += duration.as_millis() as u64;
        });
    }

    pub fn record_plan_revision(&self, run_id: &str) {
        self.update(run_id, |run| run.plan_revisions += 1);
    }

    pub fn record_tasks(&self, run_id: &str, tasks: &[Task]) {
        let complexity = complexity_bucket(tasks);
        let total = tasks.len();
        self.update(run_id, |run| {
            run.tasks_total = total;
            run.complexity = complexity;
        });
    }

    pub fn record_quality(&self, run_id: &str, checks: Vec<CheckSummary>) {
        self.update(run_id, |run| {
            run.quality_attempts += 1;
            run.quality_checks = checks;
        });
    }

    pub fn record_judge(&self, run_id: &str, verdict: &str) {
        let verdict = verdict.to_string();
        self.update(run_id, |run| {
            run.judge_attempts += 1;
            run.judge_verdict = Some(verdict);
        });
    }

    pub fn record_tokens(&self, run_id: &str, tokens: TokenCount) {
        self.update(run_id, |run| {
            run.tokens.add(tokens);
            run.token_efficiency = run.tokens.efficiency();
        });
    }

    /// Close a run. Returns the final record, or `None` if it was not open.
    pub fn finish(&self, run_id: &str, success: bool, error: Option<String>) -> Option<MetricsRun> {
        self.with_open(|open| {
            let mut run = open.remove(run_id)?;
            let completed_at = Utc::now();
            run.total_duration_ms =
                (completed_at - run.started_at).num_milliseconds().max(0) as u64;
            run.completed_at = Some(completed_at);
            run.status = if success {
                RunStatus::Success
            } else {
                RunStatus::Failed
            };
            run.error = error;
            self.persist(&run);
            Some(run)
        })
    }

    /// Snapshot of an open run.
    pub fn get(&self, run_id: &str) -> Option<MetricsRun> {
        self.with_open(|open| open.get(run_id).cloned())
    }

    /// Apply a change to an open run and persist it before releasing the
    /// lock, so history is written in the order changes were made.
    fn update<F>(&self, run_id: &str, mutate: F)
    where
        F: FnOnce(&mut MetricsRun),
    {
        self.with_open(|open| match open.get_mut(run_id) {
            Some(run) => {
                mutate(run);
                self.persist(run);
            }
            None => debug!(run_id, "Ignoring metrics update for closed run"),
        });
    }

    /// Caller must hold the open-run lock.
    fn persist(&self, run: &MetricsRun) {
        if let Err(err) = self.store.upsert(run, self.max_concurrency) {
            warn!(run_id = %run.run_id, error = %err, "Failed to persist metrics");
        }
    }

    fn with_open<R>(&self, f: impl FnOnce(&mut HashMap<String, MetricsRun>) -> R) -> R {
        let mut open = self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut open)
    }
}

/// Format aggregates for display.
pub fn format_metrics(metrics: &MetricsAggregates) -> String {
    let mut output = String::from("## Execution Metrics\n\n");

    output.push_str("### Summary\n");
    output.push_str(&format!(
        "- **Total Runs**: {} ({} successful, {} failed, {} running)\n",
        metrics.total_runs, metrics.successful_runs, metrics.failed_runs, metrics.running_runs
    ));
    output.push_str(&format!(
        "- **Success Rate**: {:.1}%\n",
        metrics.success_rate * 100.0
    ));
    output.push_str(&format!(
        "- **Mean Revisions**: {:.2}\n",
        metrics.mean_revisions
    ));
    output.push_str(&format!(
        "- **Mean Duration**: {:.1}s\n",
        metrics.mean_duration_ms as f64 / 1000.0
    ));
    output.push_str(&format!(
        "- **Concurrency Utilization**: {:.1}%\n",
        metrics.concurrency_utilization * 100.0
    ));
    output.push_str(&format!(
        "- **Token Efficiency**: {:.2}\n",
        metrics.mean_token_efficiency
    ));
    if let Some(stage) = metrics.bottleneck {
        output.push_str(&format!("- **Bottleneck**: {}\n", stage));
    }

    if !metrics.mean_duration_by_complexity.is_empty() {
        output.push_str("\n### Duration by Complexity\n");
        for (complexity, mean_ms) in &metrics.mean_duration_by_complexity {
            output.push_str(&format!(
                "- **{}**: {:.1}s\n",
                complexity,
                *mean_ms as f64 / 1000.0
            ));
        }
    }

    if !metrics.stage_stats.is_empty() {
        output.push_str("\n### Stage Durations\n");
        for (stage, stats) in &metrics.stage_stats {
            output.push_str(&format!(
                "- **{}**: mean={:.2}s, min={:.2}s, max={:.2}s (n={})\n",
                stage,
                stats.mean_ms as f64 / 1000.0,
                stats.min_ms as f64 / 1000.0,
                stats.max_ms as f64 / 1000.0,
                stats.count
            ));
        }
    }

    output
}
