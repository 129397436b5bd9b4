//! Token estimation.
//!
//! Agent CLIs do not report exact token counts, so usage is estimated from
//! the prompt and output text.

use serde::{Deserialize, Serialize};

/// Estimation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EstimationMethod {
    /// 4 chars ≈ 1 token for English text.
    CharacterBased,
    /// 1 word ≈ 1.3 tokens.
    WordBased,
    /// Higher of the two.
    #[default]
    Conservative,
}

/// Token estimator for counting tokens from text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator {
    method: EstimationMethod,
}

impl TokenEstimator {
    pub fn new(method: EstimationMethod) -> Self {
        Self { method }
    }

    /// Estimate tokens from text.
    pub fn estimate(&self, text: &str) -> u64 {
        match self.method {
            EstimationMethod::CharacterBased => estimate_by_chars(text),
            EstimationMethod::WordBased => estimate_by_words(text),
            EstimationMethod::Conservative => estimate_by_chars(text).max(estimate_by_words(text)),
        }
    }

    /// Estimate input and output tokens for one agent call.
    pub fn estimate_interaction(&self, prompt: &str, output: &str) -> TokenCount {
        TokenCount {
            input_tokens: self.estimate(prompt),
            output_tokens: self.estimate(output),
        }
    }
}

fn estimate_by_chars(text: &str) -> u64 {
    (text.chars().count() as f64 / 4.0).ceil() as u64
}

fn estimate_by_words(text: &str) -> u64 {
    (text.split_whitespace().count() as f64 * 1.3).ceil() as u64
}

/// Accumulated token estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenCount {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenCount) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    /// Share of tokens that were output: `output / (input + output)`.
    pub fn efficiency(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.output_tokens as f64 / total as f64
    }
}
