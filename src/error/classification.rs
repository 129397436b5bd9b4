//! Error classification for failure handling and the auto-loop breaker.

use serde::{Deserialize, Serialize};

/// Broad category of a failure, used to decide how the auto-loop reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Stopped by the user. Never counts as a failure.
    Cancelled,
    /// Network blips, overloaded providers and other retryable conditions.
    Transient,
    /// Quota or rate limit exhausted.
    UsageLimit,
    /// Something took too long (approval wait, gate command).
    Timeout,
    /// Everything else: bad auth, malformed output, structural plan errors.
    Fatal,
}

impl ErrorCategory {
    /// Stable label used in events and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Transient => "transient",
            ErrorCategory::UsageLimit => "usage_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Fatal => "fatal",
        }
    }

    /// Categories that pause the auto-loop on the first occurrence.
    pub fn trips_breaker_immediately(&self) -> bool {
        matches!(self, ErrorCategory::UsageLimit)
    }

    /// Whether a failure in this category counts toward the breaker.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, ErrorCategory::Cancelled)
    }
}

const USAGE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "quota",
    "usage limit",
    "too many requests",
    "429",
    "credit balance",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline exceeded"];

const TRANSIENT_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "econnreset",
    "overloaded",
    "temporarily unavailable",
    "502",
    "503",
    "504",
    "network",
];

/// Classify a free-form agent/provider error message.
pub fn classify_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches_any(USAGE_LIMIT_PATTERNS) {
        ErrorCategory::UsageLimit
    } else if matches_any(TIMEOUT_PATTERNS) {
        ErrorCategory::Timeout
    } else if matches_any(TRANSIENT_PATTERNS) {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        assert_eq!(
            classify_message("API Error: 429 Too Many Requests"),
            ErrorCategory::UsageLimit
        );
        assert_eq!(
            classify_message("You have exceeded your quota"),
            ErrorCategory::UsageLimit
        );
    }

    #[test]
    fn test_classify_timeout_and_transient() {
        assert_eq!(classify_message("request timed out"), ErrorCategory::Timeout);
        assert_eq!(
            classify_message("Overloaded, try again later"),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_classify_defaults_to_fatal() {
        assert_eq!(classify_message("invalid api key"), ErrorCategory::Fatal);
    }

    #[test]
    fn test_usage_limit_trips_breaker() {
        assert!(ErrorCategory::UsageLimit.trips_breaker_immediately());
        assert!(!ErrorCategory::Fatal.trips_breaker_immediately());
        assert!(!ErrorCategory::Cancelled.counts_as_failure());
    }

    #[test]
    fn test_labels_are_snake_case() {
        assert_eq!(ErrorCategory::UsageLimit.label(), "usage_limit");
        assert_eq!(ErrorCategory::Cancelled.label(), "cancelled");
    }
}
