//! Quality gate runner.
//!
//! Runs the configured verification commands in order inside a feature's
//! working directory. The first failure short-circuits the run and every
//! remaining gate is reported as skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GateCommand;
use crate::error::{OrchestratorError, Result};
use crate::events::CheckSummary;

/// Maximum characters of command output kept per gate.
pub const MAX_GATE_OUTPUT_CHARS: usize = 4000;

/// Outcome of a single gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pass,
    Fail,
    Skipped,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Pass => "pass",
            GateStatus::Fail => "fail",
            GateStatus::Skipped => "skipped",
        }
    }
}

/// Progress state for a quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateProgressState {
    Running,
    Passed,
    Failed,
}

/// Progress update for a quality gate.
#[derive(Debug, Clone)]
pub struct GateProgressUpdate {
    pub gate_name: String,
    pub state: GateProgressState,
    /// Only set once the gate finished.
    pub duration: Option<Duration>,
}

impl GateProgressUpdate {
    pub fn running(gate_name: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.into(),
            state: GateProgressState::Running,
            duration: None,
        }
    }

    pub fn passed(gate_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            gate_name: gate_name.into(),
            state: GateProgressState::Passed,
            duration: Some(duration),
        }
    }

    pub fn failed(gate_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            gate_name: gate_name.into(),
            state: GateProgressState::Failed,
            duration: Some(duration),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self.state,
            GateProgressState::Passed | GateProgressState::Failed
        )
    }

    /// Format the duration for display, if available.
    pub fn format_duration(&self) -> Option<String> {
        self.duration.map(|d| {
            if d.as_secs() >= 60 {
                format!(
                    "{}m{:.1}s",
                    d.as_secs() / 60,
                    (d.as_millis() % 60000) as f64 / 1000.0
                )
            } else {
                format!("{:.1}s", d.as_secs_f64())
            }
        })
    }
}

/// The result of running a single quality gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_name: String,
    pub status: GateStatus,
    /// Human-readable description of the result.
    pub message: String,
    /// Captured stdout/stderr, truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default)]
    pub duration: Duration,
}

impl GateResult {
    pub fn pass(gate_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            gate_name: gate_name.into(),
            status: GateStatus::Pass,
            message: "passed".to_string(),
            output: None,
            duration,
        }
    }

    pub fn fail(
        gate_name: impl Into<String>,
        message: impl Into<String>,
        output: Option<String>,
        duration: Duration,
    ) -> Self {
        Self {
            gate_name: gate_name.into(),
            status: GateStatus::Fail,
            message: message.into(),
            output,
            duration,
        }
    }

    pub fn skipped(gate_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            gate_name: gate_name.into(),
            status: GateStatus::Skipped,
            message: format!("Skipped: {}", reason.into()),
            output: None,
            duration: Duration::ZERO,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == GateStatus::Pass
    }
}

/// All gate results from one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub results: Vec<GateResult>,
}

impl QualityReport {
    /// Passed only if every check passed. An empty gate list passes.
    pub fn passed(&self) -> bool {
        self.results.iter().all(GateResult::passed)
    }

    pub fn total_duration(&self) -> Duration {
        self.results.iter().map(|result| result.duration).sum()
    }

    /// One-line summary of the run.
    pub fn summary(&self) -> String {
        let total = self.results.len();
        let passed = self.results.iter().filter(|r| r.passed()).count();
        let failed = self.names_with(GateStatus::Fail);
        let skipped = self.names_with(GateStatus::Skipped);

        if failed.is_empty() {
            return format!("All {total} gates passed");
        }
        let mut summary = format!("{passed}/{total} gates passed. Failed: {}", failed.join(", "));
        if !skipped.is_empty() {
            summary.push_str(&format!(". Skipped: {}", skipped.join(", ")));
        }
        summary
    }

    /// Failing gates with their output, for a fix prompt.
    pub fn failure_details(&self) -> String {
        self.results
            .iter()
            .filter(|result| result.status == GateStatus::Fail)
            .map(|result| {
                let output = result.output.as_deref().unwrap_or("(no output)");
                format!("### {}\n{}\n```\n{}\n```", result.gate_name, result.message, output)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn check_summaries(&self) -> Vec<CheckSummary> {
        self.results
            .iter()
            .map(|result| CheckSummary {
                name: result.gate_name.clone(),
                status: result.status.as_str().to_string(),
                duration_ms: result.duration.as_millis() as u64,
            })
            .collect()
    }

    fn names_with(&self, status: GateStatus) -> Vec<&str> {
        self.results
            .iter()
            .filter(|result| result.status == status)
            .map(|result| result.gate_name.as_str())
            .collect()
    }
}

/// Runs an ordered list of shell commands as quality gates.
#[derive(Debug, Clone)]
pub struct QualityGateRunner {
    gates: Vec<GateCommand>,
    timeout: Duration,
}

impl QualityGateRunner {
    pub fn new(gates: Vec<GateCommand>, timeout: Duration) -> Self {
        Self { gates, timeout }
    }

    pub fn gates(&self) -> &[GateCommand] {
        &self.gates
    }

    /// Run every gate in order, stopping at the first failure.
    pub async fn run(&self, work_dir: &Path, cancel: &CancellationToken) -> Result<QualityReport> {
        self.run_with_progress(work_dir, cancel, |_| {}).await
    }

    /// Run every gate in order with progress callbacks.
    ///
    /// The callback sees `Running` before each executed gate and `Passed`
    /// or `Failed` after it. Skipped gates produce no callbacks.
    pub async fn run_with_progress<F>(
        &self,
        work_dir: &Path,
        cancel: &CancellationToken,
        mut callback: F,
    ) -> Result<QualityReport>
    where
        F: FnMut(GateProgressUpdate),
    {
        let mut report = QualityReport::default();
        let mut failed_gate: Option<String> = None;

        for gate in &self.gates {
            if let Some(failed) = &failed_gate {
                report
                    .results
                    .push(GateResult::skipped(&gate.name, format!("{} failed", failed)));
                continue;
            }

            callback(GateProgressUpdate::running(&gate.name));
            let result = self.run_gate(gate, work_dir, cancel).await?;
            if result.passed() {
                callback(GateProgressUpdate::passed(&gate.name, result.duration));
            } else {
                callback(GateProgressUpdate::failed(&gate.name, result.duration));
                failed_gate = Some(gate.name.clone());
            }
            report.results.push(result);
        }

        info!(summary = %report.summary(), "Quality gates finished");
        Ok(report)
    }

    async fn run_gate(
        &self,
        gate: &GateCommand,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<GateResult> {
        debug!(gate = %gate.name, command = %gate.command, "Running quality gate");
        let start = Instant::now();
        let child = shell_command(&gate.command, work_dir.to_path_buf())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(err) => {
                return Ok(GateResult::fail(
                    &gate.name,
                    format!("failed to start command: {}", err),
                    None,
                    start.elapsed(),
                ))
            }
        };

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            output = tokio::time::timeout(self.timeout, child.wait_with_output()) => output,
        };
        let duration = start.elapsed();

        let output = match output {
            Err(_) => {
                warn!(gate = %gate.name, timeout_secs = self.timeout.as_secs(), "Quality gate timed out");
                return Ok(GateResult::fail(
                    &gate.name,
                    format!("timed out after {}s", self.timeout.as_secs()),
                    None,
                    duration,
                ));
            }
            Ok(Err(err)) => {
                return Ok(GateResult::fail(
                    &gate.name,
                    format!("failed to run command: {}", err),
                    None,
                    duration,
                ))
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(GateResult::pass(&gate.name, duration));
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let output_text = truncate_tail(combined.trim(), MAX_GATE_OUTPUT_CHARS);
        Ok(GateResult::fail(
            &gate.name,
            format!("exited with {}", output.status),
            (!output_text.is_empty()).then_some(output_text),
            duration,
        ))
    }
}

fn shell_command(command: &str, work_dir: PathBuf) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    cmd.current_dir(work_dir);
    cmd
}

fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(gates: Vec<(&str, &str)>) -> QualityGateRunner {
        QualityGateRunner::new(
            gates
                .into_iter()
                .map(|(name, command)| GateCommand::new(name, command))
                .collect(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_stops_after_first_failure() {
        let temp_dir = TempDir::new().expect("temp dir");
        let runner = runner(vec![
            ("lint", "true"),
            ("typecheck", "echo 'type error in main.rs' >&2; exit 2"),
            ("test", "touch ran-test"),
            ("build", "touch ran-build"),
        ]);

        let mut updates = Vec::new();
        let report = runner
            .run_with_progress(temp_dir.path(), &CancellationToken::new(), |u| {
                updates.push((u.gate_name.clone(), u.state))
            })
            .await
            .expect("run");

        let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                GateStatus::Pass,
                GateStatus::Fail,
                GateStatus::Skipped,
                GateStatus::Skipped
            ]
        );
        assert!(!report.passed());
        assert!(!temp_dir.path().join("ran-test").exists());
        assert!(!temp_dir.path().join("ran-build").exists());
        assert!(report.results[1]
            .output
            .as_deref()
            .unwrap_or_default()
            .contains("type error"));
        assert_eq!(
            report.summary(),
            "1/4 gates passed. Failed: typecheck. Skipped: test, build"
        );
        assert_eq!(updates.len(), 4);
        assert!(report.failure_details().contains("### typecheck"));
    }

    #[tokio::test]
    async fn test_all_pass_and_empty_list() {
        let temp_dir = TempDir::new().expect("temp dir");
        let report = runner(vec![("lint", "true"), ("test", "exit 0")])
            .run(temp_dir.path(), &CancellationToken::new())
            .await
            .expect("run");
        assert!(report.passed());
        assert_eq!(report.summary(), "All 2 gates passed");

        let empty = runner(Vec::new())
            .run(temp_dir.path(), &CancellationToken::new())
            .await
            .expect("run");
        assert!(empty.passed());
    }

    #[tokio::test]
    async fn test_gate_timeout_is_failure() {
        let temp_dir = TempDir::new().expect("temp dir");
        let runner = QualityGateRunner::new(
            vec![GateCommand::new("slow", "sleep 5")],
            Duration::from_millis(100),
        );
        let report = runner
            .run(temp_dir.path(), &CancellationToken::new())
            .await
            .expect("run");
        assert_eq!(report.results[0].status, GateStatus::Fail);
        assert!(report.results[0].message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let temp_dir = TempDir::new().expect("temp dir");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner(vec![("slow", "sleep 5")])
            .run(temp_dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_format_duration() {
        let update = GateProgressUpdate::passed("lint", Duration::from_millis(61500));
        assert_eq!(update.format_duration().as_deref(), Some("1m1.5s"));
        assert!(update.is_completed());
        assert!(!GateProgressUpdate::running("lint").is_completed());
    }
}
