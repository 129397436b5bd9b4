//! Prompt templates for planning, implementation, verification and judging.

use crate::config::PipelineStep;
use crate::feature::{Feature, PlanningMode, Task, TaskStatus};
use crate::quality::judge::JudgeVerdict;

/// Maximum characters of earlier output carried into a follow-up prompt.
pub const OUTPUT_EXCERPT_CHARS: usize = 6000;

pub const IMPLEMENTATION_SYSTEM_PROMPT: &str = "You are an autonomous software engineer working inside a git worktree. Make the requested changes directly in the files. Keep changes focused on the feature.";

pub const JUDGE_SYSTEM_PROMPT: &str = "You are a strict reviewer. You must not modify any files. Inspect the working tree and answer only with the requested JSON verdict.";

const LITE_TEMPLATE: &str = "Write a short implementation plan with these sections:\n## Goal\n## Approach\n## Files to Touch\n## Tasks\n## Risks";

const SPEC_TEMPLATE: &str = "Write a specification and implementation plan with these sections:\n## Goal\n## Acceptance Criteria\n## Approach\n## Data/Contract\n## UX States\n## Security\n## Performance\n## Verification\n## Tasks\n## Risks";

const FULL_TEMPLATE: &str = "Write a complete technical specification with these sections:\n## Goal\n## Background\n## Acceptance Criteria\n## Architecture\n## Data/Contract\n## UX States\n## Security\n## Performance\n## Verification\n## Rollout\n## Tasks\n## Risks\nGroup tasks into phases with `## Phase N: <name>` headers inside the task block.";

const TASK_FORMAT: &str = "List the tasks in a fenced block, one per line, exactly in this format:\n```tasks\n- [ ] T001: <description> | File: <path> | DependsOn: <ids or none> | Complexity: <low|medium|high>\n```";

/// Planning preamble plus the feature prompt.
pub fn planning_prompt(feature: &Feature, marker: &str) -> String {
    let template = match feature.planning_mode {
        PlanningMode::Skip | PlanningMode::Lite | PlanningMode::LiteWithApproval => LITE_TEMPLATE,
        PlanningMode::Spec => SPEC_TEMPLATE,
        PlanningMode::Full => FULL_TEMPLATE,
    };
    format!(
        "Plan the following feature before writing any code. Do not modify files yet.\n\n{}\n\n{}\n\n{}\n\nWhen the plan is complete, output the line {} and stop.",
        feature.prompt_text(),
        template,
        TASK_FORMAT,
        marker
    )
}

/// Ask the planner to fix structural gaps found by the quality gate.
pub fn plan_quality_revision_prompt(plan: &str, issues: &str, marker: &str) -> String {
    format!(
        "Your plan is missing required content:\n{}\n\nRewrite the full plan addressing every item. Keep the task block format.\n\n## Current plan\n{}\n\nWhen done, output the line {}.",
        issues, plan, marker
    )
}

/// Ask the planner to revise after a human rejected the plan.
pub fn plan_feedback_revision_prompt(
    feature: &Feature,
    plan: &str,
    feedback: Option<&str>,
    marker: &str,
) -> String {
    let feedback = feedback.unwrap_or("The reviewer edited the plan; use the edited plan as the new baseline.");
    format!(
        "{}\nThe plan below was reviewed and needs changes.\n\n## Reviewer feedback\n{}\n\n## Current plan\n{}\n\nRewrite the complete plan. Keep the task block format. When done, output the line {}.",
        feature.prompt_text(),
        feedback,
        plan,
        marker
    )
}

/// Ask the planner to split oversized tasks into smaller ones.
pub fn subplan_prompt(plan: &str, tasks: &[Task], marker: &str) -> String {
    let summary = tasks
        .iter()
        .map(|task| format!("- {} ({})", task.summary_line(), task.complexity))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "The plan below has tasks that are too large to execute reliably:\n{}\n\nSplit large or high-complexity tasks into smaller tasks with explicit dependencies. Return the complete revised plan.\n\n{}\n\n## Current plan\n{}\n\nWhen done, output the line {}.",
        summary, TASK_FORMAT, plan, marker
    )
}

/// Prompt for a single-call implementation.
pub fn implementation_prompt(feature: &Feature, plan: Option<&str>, feedback: Option<&str>) -> String {
    let mut prompt = format!("Implement the following feature.\n\n{}", feature.prompt_text());
    if let Some(plan) = plan {
        prompt.push_str(&format!("\n## Approved plan\n{}\n", plan));
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!("\n## Reviewer notes\n{}\n", feedback));
    }
    prompt
}

/// Prompt used when resuming with earlier agent output as context.
pub fn continuation_prompt(feature: &Feature, previous_output: &str, plan: Option<&str>) -> String {
    let mut prompt = format!(
        "Continue implementing the following feature. A previous session was interrupted; its output is below. Check the working tree, do not redo finished work, and complete what remains.\n\n{}",
        feature.prompt_text()
    );
    if let Some(plan) = plan {
        prompt.push_str(&format!("\n## Approved plan\n{}\n", plan));
    }
    prompt.push_str(&format!(
        "\n## Previous output\n{}\n",
        excerpt(previous_output, OUTPUT_EXCERPT_CHARS)
    ));
    prompt
}

/// Task-scoped prompt with completed and upcoming task summaries.
pub fn task_prompt(feature: &Feature, plan: &str, task: &Task, tasks: &[Task]) -> String {
    let completed: Vec<String> = tasks
        .iter()
        .filter(|other| other.status == TaskStatus::Completed)
        .map(|other| format!("- {}", other.summary_line()))
        .collect();
    let upcoming: Vec<String> = tasks
        .iter()
        .filter(|other| other.id != task.id && other.status == TaskStatus::Pending)
        .map(|other| format!("- {}", other.summary_line()))
        .collect();

    let mut prompt = format!(
        "You are implementing one task of a larger feature.\n\n{}\n## Current task\n{}\n",
        feature.prompt_text(),
        task.summary_line()
    );
    if let Some(phase) = &task.phase {
        prompt.push_str(&format!("Phase: {}\n", phase));
    }
    if !completed.is_empty() {
        prompt.push_str(&format!("\n## Completed tasks\n{}\n", completed.join("\n")));
    }
    if !upcoming.is_empty() {
        prompt.push_str(&format!(
            "\n## Upcoming tasks (do not implement these)\n{}\n",
            upcoming.join("\n")
        ));
    }
    prompt.push_str(&format!("\n## Full plan\n{}\n", plan));
    prompt
}

/// Prompt for a post-implementation pipeline step.
pub fn pipeline_step_prompt(feature: &Feature, step: &PipelineStep) -> String {
    format!(
        "The feature below has been implemented. Perform the following follow-up step on the working tree.\n\n{}\n## Step: {}\n{}\n",
        feature.prompt_text(),
        step.name,
        step.instructions
    )
}

/// Ask for a fix after failed quality checks.
pub fn quality_fix_prompt(feature: &Feature, failures: &str) -> String {
    format!(
        "Automated checks failed after implementing the feature below. Fix the problems without changing unrelated behavior.\n\n{}\n## Failed checks\n{}\n",
        feature.prompt_text(),
        failures
    )
}

/// Read-only judge evaluation prompt.
pub fn judge_prompt(
    feature: &Feature,
    task_summary: &str,
    quality_summary: &str,
    output: &str,
) -> String {
    format!(
        "Evaluate whether the work in this repository fulfils the feature below.\n\n{}\n## Tasks\n{}\n\n## Automated checks\n{}\n\n## Implementation output (excerpt)\n{}\n\nRespond with a JSON object only:\n{{\"verdict\": \"pass\" | \"revise\" | \"fail\", \"issues\": [\"...\"], \"recommendations\": [\"...\"]}}",
        feature.prompt_text(),
        task_summary,
        quality_summary,
        excerpt(output, OUTPUT_EXCERPT_CHARS)
    )
}

/// Ask for a targeted fix after a "revise" verdict.
pub fn judge_revision_prompt(feature: &Feature, verdict: &JudgeVerdict) -> String {
    let issues = bullet_list(&verdict.issues);
    let recommendations = bullet_list(&verdict.recommendations);
    format!(
        "A reviewer asked for changes to the implementation of the feature below. Address each issue.\n\n{}\n## Issues\n{}\n\n## Recommendations\n{}\n",
        feature.prompt_text(),
        issues,
        recommendations
    )
}

/// Summary of tasks and their statuses for the judge.
pub fn task_summary(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "(implemented in a single pass)".to_string();
    }
    tasks
        .iter()
        .map(|task| format!("- [{:?}] {}", task.status, task.summary_line()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tail of `text` limited to roughly `max_chars` characters.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("...\n{}", tail)
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none listed)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planning_prompt_mentions_marker_and_format() {
        let feature = Feature::new("f1", "Login").with_planning_mode(PlanningMode::Spec);
        let prompt = planning_prompt(&feature, "[PLAN_GENERATED]");
        assert!(prompt.contains("[PLAN_GENERATED]"));
        assert!(prompt.contains("Acceptance Criteria"));
        assert!(prompt.contains("DependsOn"));
    }

    #[test]
    fn test_task_prompt_lists_neighbours() {
        let feature = Feature::new("f1", "Login");
        let mut done = Task::new("T001", "model");
        done.status = TaskStatus::Completed;
        let current = Task::new("T002", "hashing");
        let next = Task::new("T003", "endpoint");
        let tasks = vec![done, current.clone(), next];

        let prompt = task_prompt(&feature, "PLAN", &current, &tasks);
        assert!(prompt.contains("## Current task\nT002: hashing"));
        assert!(prompt.contains("## Completed tasks\n- T001: model"));
        assert!(prompt.contains("- T003: endpoint"));
        assert!(!prompt.contains("- T002: hashing"));
        assert!(prompt.ends_with("## Full plan\nPLAN\n"));
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("abcdefghij", 3), "...\nhij");
    }
}
