//! Working directory resolution.
//!
//! Worktrees are created outside this crate. A feature with a branch runs in
//! `<worktrees_dir>/<branch>` when that directory exists and in the project
//! root otherwise.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::feature::Feature;

/// Directory name used for a branch's worktree.
pub fn sanitize_branch(branch: &str) -> String {
    branch
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '-',
        })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_string()
}

/// Where the feature's agent calls and gate commands run.
pub fn resolve_working_dir(project_root: &Path, worktrees_dir: &Path, feature: &Feature) -> PathBuf {
    let Some(branch) = feature.branch_name.as_deref().filter(|b| !b.trim().is_empty()) else {
        return project_root.to_path_buf();
    };
    let name = sanitize_branch(branch);
    if name.is_empty() {
        return project_root.to_path_buf();
    }

    let base = if worktrees_dir.is_absolute() {
        worktrees_dir.to_path_buf()
    } else {
        project_root.join(worktrees_dir)
    };
    let candidate = base.join(&name);
    if candidate.is_dir() {
        debug!(feature_id = %feature.id, path = %candidate.display(), "Using worktree");
        candidate
    } else {
        warn!(
            feature_id = %feature.id,
            branch,
            expected = %candidate.display(),
            "Worktree not found, running in the project root"
        );
        project_root.to_path_buf()
    }
}
