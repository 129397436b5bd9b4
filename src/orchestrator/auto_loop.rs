//! Auto-loop controller.
//!
//! A single background task keeps up to `max_concurrency` features in
//! flight, starting the oldest startable feature whose dependencies are
//! satisfied. Failures feed the [`FailureTracker`]; when it trips the loop
//! pauses itself and waits for an operator.

use std::collections::{HashMap, HashSet};
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MAX_FEATURE_CONCURRENCY;
use crate::error::{ErrorCategory, OrchestratorError, Result};
use crate::events::OrchestratorEvent;
use crate::feature::{Feature, FeatureStatus};
use crate::orchestrator::breaker::{BreakerDecision, FailureTracker};
use crate::orchestrator::Orchestrator;
use crate::state::ExecutionState;

/// Idle polls back off up to this multiple of the poll interval.
const MAX_IDLE_BACKOFF: u32 = 4;

pub(crate) struct AutoLoopHandle {
    cancel: CancellationToken,
    max_concurrency: usize,
    task: Option<JoinHandle<()>>,
}

/// Whether a dependency in `status` unblocks its dependents.
pub fn dependency_satisfied(status: &FeatureStatus, require_verified: bool) -> bool {
    match status {
        FeatureStatus::Verified => true,
        FeatureStatus::WaitingApproval => !require_verified,
        _ => false,
    }
}

impl Orchestrator {
    fn auto_loop_slot(&self) -> MutexGuard<'_, Option<AutoLoopHandle>> {
        self.inner
            .auto_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn breaker(&self) -> MutexGuard<'_, FailureTracker> {
        self.inner
            .breaker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the auto-loop. `max_concurrency` overrides the configured cap.
    pub fn start_auto_loop(&self, max_concurrency: Option<usize>) -> Result<()> {
        let cap = max_concurrency
            .unwrap_or(self.config().max_concurrency)
            .clamp(1, MAX_FEATURE_CONCURRENCY);
        {
            let mut slot = self.auto_loop_slot();
            if slot.as_ref().is_some_and(|handle| !handle.cancel.is_cancelled()) {
                return Err(OrchestratorError::AlreadyRunning("auto-loop".to_string()));
            }
            self.breaker().reset();
            let cancel = CancellationToken::new();
            let this = self.clone();
            let token = cancel.clone();
            let task = tokio::spawn(async move { this.run_auto_loop(token, cap).await });
            *slot = Some(AutoLoopHandle {
                cancel,
                max_concurrency: cap,
                task: Some(task),
            });
        }

        info!(max_concurrency = cap, "Auto-loop started");
        self.events()
            .emit(OrchestratorEvent::AutoLoopStarted { max_concurrency: cap });
        self.persist_execution_state();
        Ok(())
    }

    /// Explicit user stop. Running features keep going; the execution-state
    /// snapshot is removed so the next start does not treat this as a crash.
    pub async fn stop_auto_loop(&self) -> bool {
        let handle = self.auto_loop_slot().take();
        let stopped = match handle {
            Some(mut handle) => {
                handle.cancel.cancel();
                if let Some(task) = handle.task.take() {
                    if let Err(err) = task.await {
                        warn!(error = %err, "Auto-loop task ended abnormally");
                    }
                }
                info!("Auto-loop stopped");
                self.events().emit(OrchestratorEvent::AutoLoopStopped);
                true
            }
            None => false,
        };
        if let Err(err) = self.state_store().clear() {
            warn!(error = %err, "Failed to clear execution state");
        }
        stopped
    }

    pub fn is_auto_loop_running(&self) -> bool {
        self.auto_loop_slot()
            .as_ref()
            .is_some_and(|handle| !handle.cancel.is_cancelled())
    }

    /// Feature cap of the running auto-loop.
    pub fn auto_loop_capacity(&self) -> Option<usize> {
        self.auto_loop_slot()
            .as_ref()
            .filter(|handle| !handle.cancel.is_cancelled())
            .map(|handle| handle.max_concurrency)
    }

    /// Feed a finished run into the breaker. `None` means success.
    pub(crate) fn record_feature_result(&self, failure: Option<ErrorCategory>) {
        let decision = {
            let mut breaker = self.breaker();
            match failure {
                None => {
                    breaker.record_success();
                    BreakerDecision::Continue
                }
                Some(category) => breaker.record_failure(category),
            }
        };
        if let BreakerDecision::Trip { reason, failures } = decision {
            self.pause_auto_loop(reason, failures);
        }
    }

    fn pause_auto_loop(&self, reason: String, failures: u32) {
        let handle = self.auto_loop_slot().take();
        let Some(handle) = handle else {
            return;
        };
        handle.cancel.cancel();
        warn!(reason = %reason, failures, "Pausing auto-loop after failures");

        let state = ExecutionState::new(
            false,
            handle.max_concurrency,
            self.running_ids().into_iter().collect(),
        );
        if let Err(err) = self.state_store().save(&state) {
            warn!(error = %err, "Failed to save execution state");
        }
        self.events()
            .emit(OrchestratorEvent::AutoLoopPaused { reason, failures });
    }

    /// Oldest startable feature that is not running and whose dependencies
    /// are satisfied.
    pub fn next_ready_feature(&self, running: &HashSet<String>) -> Result<Option<Feature>> {
        let features = self.store().list()?;
        let require_verified = self.config().require_verified_dependencies;
        let statuses: HashMap<&str, &FeatureStatus> = features
            .iter()
            .map(|feature| (feature.id.as_str(), &feature.status))
            .collect();

        Ok(features
            .iter()
            .find(|feature| {
                feature.status.is_startable()
                    && !running.contains(&feature.id)
                    && feature.dependencies.iter().all(|dep| {
                        statuses
                            .get(dep.as_str())
                            .is_some_and(|status| dependency_satisfied(status, require_verified))
                    })
            })
            .cloned())
    }

    async fn run_auto_loop(self, cancel: CancellationToken, max_concurrency: usize) {
        let poll_interval = self.config().poll_interval();
        let mut idle_rounds: u32 = 0;

        while !cancel.is_cancelled() {
            let running = self.running_ids();
            if running.len() < max_concurrency {
                match self.next_ready_feature(&running) {
                    Ok(Some(feature)) => match self.spawn_feature(&feature.id) {
                        Ok(_) => {
                            info!(feature_id = %feature.id, "Auto-loop started feature");
                            idle_rounds = 0;
                            continue;
                        }
                        Err(err) => {
                            warn!(feature_id = %feature.id, error = %err, "Auto-loop could not start feature");
                        }
                    },
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "Auto-loop failed to list features"),
                }
            }

            let delay = if running.is_empty() {
                if idle_rounds == 0 {
                    debug!("Auto-loop idle");
                    self.events().emit(OrchestratorEvent::AutoLoopIdle);
                }
                idle_rounds = idle_rounds.saturating_add(1);
                poll_interval * idle_rounds.min(MAX_IDLE_BACKOFF)
            } else {
                idle_rounds = 0;
                poll_interval
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay.max(Duration::from_millis(1))) => {}
            }
        }
        debug!("Auto-loop task exiting");
    }
}
