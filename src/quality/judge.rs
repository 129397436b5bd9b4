//! Judge verdict parsing.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Issue recorded when the judge's answer cannot be parsed.
pub const UNPARSABLE_VERDICT_ISSUE: &str =
    "Judge response could not be parsed; review the implementation against the feature description.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Revise,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Revise => "revise",
            Verdict::Fail => "fail",
        }
    }
}

/// Structured judge answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub verdict: Verdict,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl JudgeVerdict {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    fn unparsable() -> Self {
        Self {
            verdict: Verdict::Revise,
            issues: vec![UNPARSABLE_VERDICT_ISSUE.to_string()],
            recommendations: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Parse the judge's output. Anything unparsable becomes "revise".
pub fn parse_verdict(output: &str) -> JudgeVerdict {
    for candidate in json_candidates(output) {
        let Ok(raw) = serde_json::from_str::<RawVerdict>(candidate) else {
            continue;
        };
        let verdict = match raw.verdict.trim().to_ascii_lowercase().as_str() {
            "pass" | "passed" | "approve" | "approved" => Verdict::Pass,
            "revise" | "needs_revision" | "needs revision" => Verdict::Revise,
            "fail" | "failed" | "reject" => Verdict::Fail,
            other => {
                debug!(verdict = other, "Unknown judge verdict");
                continue;
            }
        };
        return JudgeVerdict {
            verdict,
            issues: raw.issues,
            recommendations: raw.recommendations,
        };
    }
    JudgeVerdict::unparsable()
}

/// Brace-balanced object candidates, last one first.
fn json_candidates(text: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let bytes = text.as_bytes();
    let mut start = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (index, &byte) in bytes.iter().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(index);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(begin) = start.take() {
                        candidates.push(&text[begin..=index]);
                    }
                }
            }
            _ => {}
        }
    }
    candidates.reverse();
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let verdict = parse_verdict(r#"{"verdict":"pass","issues":[],"recommendations":["add docs"]}"#);
        assert!(verdict.passed());
        assert_eq!(verdict.recommendations, vec!["add docs"]);
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let output = "Looks mostly fine.\n```json\n{\"verdict\": \"revise\", \"issues\": [\"missing {edge} case\"]}\n```\nThanks";
        let verdict = parse_verdict(output);
        assert_eq!(verdict.verdict, Verdict::Revise);
        assert_eq!(verdict.issues, vec!["missing {edge} case"]);
    }

    #[test]
    fn test_unparsable_output_is_revise() {
        let verdict = parse_verdict("I think it is good.");
        assert_eq!(verdict.verdict, Verdict::Revise);
        assert_eq!(verdict.issues, vec![UNPARSABLE_VERDICT_ISSUE.to_string()]);

        let unknown = parse_verdict(r#"{"verdict":"maybe"}"#);
        assert_eq!(unknown.verdict, Verdict::Revise);
    }

    #[test]
    fn test_last_object_wins() {
        let output = r#"{"verdict":"fail"} then reconsidered {"verdict":"pass"}"#;
        assert!(parse_verdict(output).passed());
    }
}
