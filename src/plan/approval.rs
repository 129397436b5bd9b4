//! Pending plan approvals.
//!
//! At most one waiter exists per feature. A waiter is resolved exactly once,
//! by whichever of approve, reject, cancel or the timeout timer removes it
//! from the table first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

/// How a pending approval was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved {
        edited_plan: Option<String>,
        feedback: Option<String>,
    },
    Rejected {
        feedback: Option<String>,
        edited_plan: Option<String>,
    },
    TimedOut,
    /// The feature was stopped while waiting.
    Cancelled,
}

impl ApprovalDecision {
    /// A rejection that carries something to revise from.
    pub fn is_revision_request(&self) -> bool {
        match self {
            ApprovalDecision::Rejected {
                feedback,
                edited_plan,
            } => has_text(feedback) || has_text(edited_plan),
            _ => false,
        }
    }
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|text| !text.trim().is_empty())
}

/// A waiting approval, as listed to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingApproval {
    pub feature_id: String,
    pub since: DateTime<Utc>,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<ApprovalDecision>,
    timer: Option<JoinHandle<()>>,
    since: DateTime<Utc>,
}

/// Receiving side of a registered approval.
#[derive(Debug)]
pub struct ApprovalHandle {
    feature_id: String,
    rx: oneshot::Receiver<ApprovalDecision>,
}

impl ApprovalHandle {
    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    /// Wait for the decision. A dropped sender counts as cancellation.
    pub async fn wait(self) -> ApprovalDecision {
        self.rx.await.unwrap_or(ApprovalDecision::Cancelled)
    }
}

/// Table of pending approval waiters, one per feature.
#[derive(Clone)]
pub struct ApprovalRegistry {
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

impl std::fmt::Debug for ApprovalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalRegistry")
            .field("pending", &self.pending().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApprovalRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    /// Register the single waiter for a feature and arm its timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, feature_id: &str) -> Result<ApprovalHandle> {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut waiters = self.lock();
            if waiters.contains_key(feature_id) {
                return Err(OrchestratorError::ApprovalPending(feature_id.to_string()));
            }
            waiters.insert(
                feature_id.to_string(),
                Waiter {
                    id,
                    tx,
                    timer: None,
                    since: Utc::now(),
                },
            );
        }

        let timer = self.spawn_timer(feature_id.to_string(), id);
        if let Some(waiter) = self.lock().get_mut(feature_id) {
            if waiter.id == id {
                waiter.timer = Some(timer);
            } else {
                timer.abort();
            }
        } else {
            timer.abort();
        }

        debug!(feature_id, waiter_id = id, "Registered plan approval waiter");
        Ok(ApprovalHandle {
            feature_id: feature_id.to_string(),
            rx,
        })
    }

    /// Approve the pending plan, optionally with edits and feedback.
    pub fn approve(
        &self,
        feature_id: &str,
        edited_plan: Option<String>,
        feedback: Option<String>,
    ) -> Result<()> {
        self.resolve(
            feature_id,
            ApprovalDecision::Approved {
                edited_plan,
                feedback,
            },
        )
    }

    /// Reject the pending plan. Feedback or edits request a revision.
    pub fn reject(
        &self,
        feature_id: &str,
        feedback: Option<String>,
        edited_plan: Option<String>,
    ) -> Result<()> {
        self.resolve(
            feature_id,
            ApprovalDecision::Rejected {
                feedback,
                edited_plan,
            },
        )
    }

    /// Force-resolve any waiter for the feature as cancelled.
    pub fn cancel(&self, feature_id: &str) -> bool {
        match self.take(feature_id, None) {
            Some(waiter) => {
                info!(feature_id, "Cancelling pending plan approval");
                deliver(feature_id, waiter, ApprovalDecision::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, feature_id: &str) -> bool {
        self.lock().contains_key(feature_id)
    }

    /// Pending approvals, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut pending: Vec<_> = self
            .lock()
            .iter()
            .map(|(feature_id, waiter)| PendingApproval {
                feature_id: feature_id.clone(),
                since: waiter.since,
            })
            .collect();
        pending.sort_by(|a, b| a.since.cmp(&b.since));
        pending
    }

    fn resolve(&self, feature_id: &str, decision: ApprovalDecision) -> Result<()> {
        let waiter = self
            .take(feature_id, None)
            .ok_or_else(|| OrchestratorError::NoPendingApproval(feature_id.to_string()))?;
        deliver(feature_id, waiter, decision);
        Ok(())
    }

    /// Remove the waiter, optionally only if it is the one with `id`.
    fn take(&self, feature_id: &str, id: Option<u64>) -> Option<Waiter> {
        let mut waiters = self.lock();
        match (waiters.get(feature_id), id) {
            (Some(waiter), Some(id)) if waiter.id != id => None,
            (Some(_), _) => waiters.remove(feature_id),
            (None, _) => None,
        }
    }

    fn spawn_timer(&self, feature_id: String, id: u64) -> JoinHandle<()> {
        let registry = self.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(mut waiter) = registry.take(&feature_id, Some(id)) {
                warn!(feature_id = %feature_id, timeout_secs = timeout.as_secs(), "Plan approval timed out");
                // Already running inside this timer; nothing to abort.
                waiter.timer = None;
                deliver(&feature_id, waiter, ApprovalDecision::TimedOut);
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn deliver(feature_id: &str, waiter: Waiter, decision: ApprovalDecision) {
    if let Some(timer) = waiter.timer {
        timer.abort();
    }
    if waiter.tx.send(decision).is_err() {
        debug!(feature_id, "Approval waiter was already dropped");
    }
}
