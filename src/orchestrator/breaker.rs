//! Consecutive-failure circuit breaker for the auto-loop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ErrorCategory;

/// What the auto-loop should do after a failure is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerDecision {
    Continue,
    /// Stop starting new features.
    Trip { reason: String, failures: u32 },
}

/// Counts failures inside a rolling window. Any success resets it.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    window: Duration,
    failures: VecDeque<Instant>,
}

impl FailureTracker {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            failures: VecDeque::new(),
        }
    }

    /// Failures currently inside the window.
    pub fn failures(&self) -> u32 {
        self.failures.len() as u32
    }

    pub fn record_failure(&mut self, category: ErrorCategory) -> BreakerDecision {
        self.record_failure_at(category, Instant::now())
    }

    /// Record a failure observed at `now`.
    pub fn record_failure_at(&mut self, category: ErrorCategory, now: Instant) -> BreakerDecision {
        if !category.counts_as_failure() {
            return BreakerDecision::Continue;
        }
        self.prune(now);
        self.failures.push_back(now);
        let failures = self.failures();

        if category.trips_breaker_immediately() {
            warn!(category = category.label(), "Usage limit reached, tripping breaker");
            return BreakerDecision::Trip {
                reason: format!("{} error", category.label()),
                failures,
            };
        }
        if failures >= self.threshold {
            warn!(failures, threshold = self.threshold, "Failure threshold reached");
            return BreakerDecision::Trip {
                reason: format!(
                    "{} failures within {}s",
                    failures,
                    self.window.as_secs()
                ),
                failures,
            };
        }
        debug!(failures, threshold = self.threshold, "Recorded feature failure");
        BreakerDecision::Continue
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
    }

    /// Forget everything, e.g. when the loop is restarted.
    pub fn reset(&mut self) {
        self.failures.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}
