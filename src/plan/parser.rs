//! Task block parsing.
//!
//! Plans carry their machine-readable tasks in a fenced block:
//!
//! ```text
//! ## Phase 1: Foundation
//! - [ ] T001: Add config loader | File: src/config.rs | Complexity: low
//! - [ ] T002: Wire loader into main | File: src/main.rs | DependsOn: T001
//! ```
//!
//! Parsing looks inside fenced blocks first and falls back to the whole
//! text when no fenced block holds task lines.

use std::sync::OnceLock;

use regex::Regex;

use crate::feature::{Complexity, Task, TaskStatus};

fn task_line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[-*]\s+\[( |x|X)\]\s+(T\d+)\s*:\s*(.*?)\s*$").ok())
        .as_ref()
}

fn phase_header_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*#{2,4}\s*Phase\s+(\d+)\s*(?::\s*(.*?))?\s*$").ok())
        .as_ref()
}

/// Text before the completion marker, or `None` when the marker is absent.
pub fn extract_plan(text: &str, marker: &str) -> Option<String> {
    text.find(marker)
        .map(|index| text[..index].trim_end().to_string())
}

/// Parse every task line in the plan, in document order.
pub fn parse_tasks(plan: &str) -> Vec<Task> {
    let fenced = fenced_blocks(plan);
    let from_blocks: Vec<Task> = fenced
        .iter()
        .flat_map(|block| parse_task_lines(block))
        .collect();
    if !from_blocks.is_empty() {
        return dedup_by_id(from_blocks);
    }
    dedup_by_id(parse_task_lines(plan))
}

fn parse_task_lines(text: &str) -> Vec<Task> {
    let (Some(task_re), Some(phase_re)) = (task_line_regex(), phase_header_regex()) else {
        return Vec::new();
    };
    let mut tasks = Vec::new();
    let mut phase: Option<String> = None;

    for line in text.lines() {
        if let Some(caps) = phase_re.captures(line) {
            let number = &caps[1];
            phase = Some(match caps.get(2).map(|m| m.as_str()).filter(|s| !s.is_empty()) {
                Some(name) => format!("Phase {}: {}", number, name),
                None => format!("Phase {}", number),
            });
            continue;
        }
        let Some(caps) = task_re.captures(line) else {
            continue;
        };

        let done = !caps[1].trim().is_empty();
        let mut task = Task::new(&caps[2], "");
        task.phase = phase.clone();
        if done {
            task.status = TaskStatus::Completed;
        }

        let mut fields = caps[3].split(" | ");
        task.description = fields.next().unwrap_or_default().trim().to_string();
        for field in fields {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "file" => {
                    if !value.is_empty() {
                        task.file_path = Some(value.to_string());
                    }
                }
                "dependson" | "depends on" | "deps" => {
                    task.depends_on = parse_dependency_list(value);
                }
                "complexity" => task.complexity = Complexity::parse_lenient(value),
                _ => {}
            }
        }
        tasks.push(task);
    }

    tasks
}

fn parse_dependency_list(value: &str) -> Vec<String> {
    value
        .split([',', ' '])
        .map(str::trim)
        .filter(|id| !id.is_empty() && !id.eq_ignore_ascii_case("none") && *id != "-")
        .map(str::to_string)
        .collect()
}

fn dedup_by_id(tasks: Vec<Task>) -> Vec<Task> {
    let mut seen = std::collections::HashSet::new();
    tasks
        .into_iter()
        .filter(|task| seen.insert(task.id.clone()))
        .collect()
}

fn fenced_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            match current.take() {
                Some(lines) => blocks.push(lines.join("\n")),
                None => current = Some(Vec::new()),
            }
            continue;
        }
        if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    blocks
}

/// Render tasks back into the fenced task block format.
pub fn format_task_block(tasks: &[Task]) -> String {
    let mut output = String::from("```tasks\n");
    let mut current_phase: Option<&str> = None;
    for task in tasks {
        if let Some(phase) = task.phase.as_deref() {
            if current_phase != Some(phase) {
                output.push_str(&format!("## {}\n", phase));
                current_phase = Some(phase);
            }
        }
        let check = if task.status == TaskStatus::Completed {
            "x"
        } else {
            " "
        };
        output.push_str(&format!("- [{}] {}: {}", check, task.id, task.description));
        if let Some(path) = &task.file_path {
            output.push_str(&format!(" | File: {}", path));
        }
        if !task.depends_on.is_empty() {
            output.push_str(&format!(" | DependsOn: {}", task.depends_on.join(", ")));
        }
        output.push_str(&format!(" | Complexity: {}\n", task.complexity));
    }
    output.push_str("```\n");
    output
}
