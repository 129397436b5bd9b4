//! Structural checks applied to a generated plan before anyone sees it.

use crate::feature::{PlanningMode, Task};

/// Minimum parsed tasks for spec and full plans.
pub const MIN_SPEC_TASKS: usize = 3;

const LITE_SECTIONS: &[(&str, &[&str])] = &[
    ("Goal", &["goal"]),
    ("Approach", &["approach"]),
    ("Files to Touch", &["files to touch", "files to modify", "files"]),
    ("Tasks", &["tasks"]),
    ("Risks", &["risks", "risk"]),
];

const SPEC_SECTIONS: &[(&str, &[&str])] = &[
    ("Acceptance Criteria", &["acceptance criteria"]),
    ("Verification", &["verification", "testing strategy"]),
    ("Security", &["security"]),
    ("Performance", &["performance"]),
    ("UX States", &["ux", "user experience"]),
    ("Data/Contract", &["data", "contract", "api contract", "data model"]),
];

/// Outcome of the plan-quality gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanQualityReport {
    pub issues: Vec<String>,
}

impl PlanQualityReport {
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }

    /// Bullet list of the issues for a revision prompt.
    pub fn as_bullets(&self) -> String {
        self.issues
            .iter()
            .map(|issue| format!("- {}", issue))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Check a plan for the sections and task count its mode requires.
pub fn check_plan_quality(mode: PlanningMode, plan: &str, tasks: &[Task]) -> PlanQualityReport {
    let headings = headings(plan);
    let mut issues = Vec::new();

    let required = match mode {
        PlanningMode::Skip => return PlanQualityReport::default(),
        PlanningMode::Lite | PlanningMode::LiteWithApproval => LITE_SECTIONS,
        PlanningMode::Spec | PlanningMode::Full => SPEC_SECTIONS,
    };
    for (name, aliases) in required {
        if !has_section(&headings, aliases) {
            issues.push(format!("Missing section: {}", name));
        }
    }

    if matches!(mode, PlanningMode::Spec | PlanningMode::Full) && tasks.len() < MIN_SPEC_TASKS {
        issues.push(format!(
            "Expected at least {} parsed tasks, found {}",
            MIN_SPEC_TASKS,
            tasks.len()
        ));
    }

    PlanQualityReport { issues }
}

/// Lowercased words of each heading, including `**Bold:**` pseudo-headings.
fn headings(plan: &str) -> Vec<Vec<String>> {
    plan.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix('#') {
                Some(words(rest))
            } else if trimmed.starts_with("**") {
                Some(words(trimmed))
            } else {
                None
            }
        })
        .collect()
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// An alias matches when its words appear consecutively in a heading.
fn has_section(headings: &[Vec<String>], aliases: &[&str]) -> bool {
    headings.iter().any(|heading| {
        aliases.iter().any(|alias| {
            let alias: Vec<&str> = alias.split_whitespace().collect();
            heading.windows(alias.len()).any(|window| {
                window
                    .iter()
                    .zip(&alias)
                    .all(|(word, expected)| word.as_str() == *expected)
            })
        })
    })
}
