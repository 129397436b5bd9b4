//! Dependency-aware task scheduler.
//!
//! Runs a plan's tasks under a concurrency cap. A task is ready when it is
//! pending and every id it depends on is completed. The scheduler is an
//! explicit loop over a [`JoinSet`]: admit ready tasks while slots are free,
//! wait for any task to finish, record the result and go again.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::clamp_task_concurrency;
use crate::error::{OrchestratorError, Result};
use crate::feature::{Task, TaskStatus};

/// Runs one task to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task`. `tasks` is a snapshot of the whole list at start time,
    /// for building task-scoped context.
    async fn execute_task(&self, task: Task, tasks: Vec<Task>) -> Result<()>;
}

/// Status transitions reported to the scheduler's observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerUpdate {
    TaskStarted { task_id: String },
    TaskFinished { task_id: String, success: bool },
    PhaseComplete { phase: String },
    TasksBlocked { task_ids: Vec<String> },
}

/// Configuration options for task execution.
#[derive(Clone, Debug)]
pub struct TaskSchedulerConfig {
    /// Maximum number of tasks to execute concurrently (1..=8).
    pub max_concurrency: usize,
}

impl Default for TaskSchedulerConfig {
    fn default() -> Self {
        Self { max_concurrency: 3 }
    }
}

/// Tracks execution state across one scheduler run.
#[derive(Clone, Debug, Default)]
pub struct ParallelExecutionState {
    pub in_flight: HashSet<String>,
    pub completed: HashSet<String>,
    /// Failed task ids mapped to their error message.
    pub failed: HashMap<String, String>,
    pub cancelled: bool,
}

impl ParallelExecutionState {
    /// The first failure, which stops admission of new work.
    fn first_failure(&self, order: &[Task]) -> Option<(String, String)> {
        order.iter().find_map(|task| {
            self.failed
                .get(&task.id)
                .map(|message| (task.id.clone(), message.clone()))
        })
    }

    fn admitting(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Bounded worker pool over a dynamic ready set.
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    config: TaskSchedulerConfig,
}

impl TaskScheduler {
    pub fn new(config: TaskSchedulerConfig) -> Self {
        Self {
            config: TaskSchedulerConfig {
                max_concurrency: clamp_task_concurrency(config.max_concurrency),
            },
        }
    }

    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self::new(TaskSchedulerConfig { max_concurrency })
    }

    pub fn max_concurrency(&self) -> usize {
        self.config.max_concurrency
    }

    /// Run every pending task, returning the final task list.
    ///
    /// `on_update` is called from the scheduling loop after each status
    /// transition with the current list, so it is the single writer of
    /// persisted progress. Tasks already completed are left alone.
    ///
    /// Errors:
    /// - `TaskFailed` after the first failure; in-flight tasks drain and
    ///   remaining pending tasks are blocked.
    /// - `DependencyCycle` when pending tasks remain but none can start.
    /// - `UnresolvableDependencies` when tasks reference unknown ids.
    /// - `Cancelled` when the token fires; in-flight tasks drain.
    pub async fn run<F>(
        &self,
        mut tasks: Vec<Task>,
        executor: Arc<dyn TaskExecutor>,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> Result<Vec<Task>>
    where
        F: FnMut(&[Task], &SchedulerUpdate),
    {
        let cap = self.config.max_concurrency;
        let mut state = ParallelExecutionState::default();
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
            state.completed.insert(task.id.clone());
        }

        let unresolvable = block_unresolvable(&mut tasks);
        if !unresolvable.is_empty() {
            warn!(task_ids = ?unresolvable, "Tasks reference unknown dependencies");
            on_update(
                &tasks,
                &SchedulerUpdate::TasksBlocked {
                    task_ids: unresolvable.clone(),
                },
            );
        }

        info!(
            total = tasks.len(),
            completed = state.completed.len(),
            max_concurrency = cap,
            "Starting task scheduler"
        );

        let mut join_set: JoinSet<(String, Result<()>)> = JoinSet::new();
        loop {
            if state.admitting() {
                while join_set.len() < cap {
                    let Some(index) = next_ready(&tasks) else {
                        break;
                    };
                    tasks[index].status = TaskStatus::InProgress;
                    let task = tasks[index].clone();
                    state.in_flight.insert(task.id.clone());
                    debug!(task_id = %task.id, in_flight = state.in_flight.len(), "Starting task");
                    on_update(
                        &tasks,
                        &SchedulerUpdate::TaskStarted {
                            task_id: task.id.clone(),
                        },
                    );

                    let snapshot = tasks.clone();
                    let executor = Arc::clone(&executor);
                    join_set.spawn(async move {
                        let task_id = task.id.clone();
                        let result = AssertUnwindSafe(executor.execute_task(task, snapshot))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                Err(OrchestratorError::TaskFailed {
                                    task_id: task_id.clone(),
                                    message: "task executor panicked".to_string(),
                                })
                            });
                        (task_id, result)
                    });
                }
            }

            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !state.cancelled => {
                    info!(in_flight = join_set.len(), "Scheduler cancelled, draining in-flight tasks");
                    state.cancelled = true;
                    continue;
                }
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };
            let (task_id, result) = match joined {
                Ok(finished) => finished,
                Err(err) => {
                    warn!(error = %err, "Task join failed");
                    continue;
                }
            };

            state.in_flight.remove(&task_id);
            let Some(index) = tasks.iter().position(|t| t.id == task_id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    tasks[index].status = TaskStatus::Completed;
                    state.completed.insert(task_id.clone());
                    debug!(task_id = %task_id, "Task completed");
                }
                Err(err) => {
                    tasks[index].status = TaskStatus::Failed;
                    if err.is_cancellation() {
                        state.cancelled = true;
                    }
                    warn!(task_id = %task_id, error = %err, "Task failed");
                    state.failed.insert(task_id.clone(), failure_message(err));
                }
            }
            let success = tasks[index].status == TaskStatus::Completed;
            on_update(
                &tasks,
                &SchedulerUpdate::TaskFinished {
                    task_id: task_id.clone(),
                    success,
                },
            );
            if success {
                if let Some(phase) = completed_phase(&tasks, index) {
                    on_update(&tasks, &SchedulerUpdate::PhaseComplete { phase });
                }
            }
        }

        // Tasks whose join failed never reported back.
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Failed;
                state
                    .failed
                    .entry(task.id.clone())
                    .or_insert_with(|| "task did not report a result".to_string());
            }
        }

        if state.cancelled {
            return Err(OrchestratorError::Cancelled);
        }

        if let Some((task_id, message)) = state.first_failure(&tasks) {
            let blocked = block_pending(&mut tasks);
            if !blocked.is_empty() {
                on_update(&tasks, &SchedulerUpdate::TasksBlocked { task_ids: blocked });
            }
            return Err(OrchestratorError::TaskFailed { task_id, message });
        }

        let stalled = block_pending(&mut tasks);
        if !stalled.is_empty() {
            on_update(
                &tasks,
                &SchedulerUpdate::TasksBlocked {
                    task_ids: stalled.clone(),
                },
            );
            let cycle = cycle_members(&tasks, &stalled);
            if !cycle.is_empty() {
                return Err(OrchestratorError::DependencyCycle { task_ids: cycle });
            }
            if !unresolvable.is_empty() {
                let mut task_ids = unresolvable;
                task_ids.extend(stalled);
                return Err(OrchestratorError::UnresolvableDependencies { task_ids });
            }
            return Err(OrchestratorError::DependencyCycle { task_ids: stalled });
        }

        if !unresolvable.is_empty() {
            return Err(OrchestratorError::UnresolvableDependencies {
                task_ids: unresolvable,
            });
        }

        info!(completed = state.completed.len(), "All tasks completed");
        Ok(tasks)
    }
}

/// First pending task, in document order, whose dependencies are completed.
pub fn next_ready(tasks: &[Task]) -> Option<usize> {
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Completed)
        .map(|task| task.id.as_str())
        .collect();
    tasks.iter().position(|task| {
        task.status == TaskStatus::Pending
            && task
                .depends_on
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
    })
}

/// Block pending tasks that depend on ids missing from the list.
fn block_unresolvable(tasks: &mut [Task]) -> Vec<String> {
    let known: HashSet<String> = tasks.iter().map(|task| task.id.clone()).collect();
    let mut blocked = Vec::new();
    for task in tasks.iter_mut() {
        if task.status == TaskStatus::Completed {
            continue;
        }
        if task.depends_on.iter().any(|dep| !known.contains(dep)) {
            task.status = TaskStatus::Blocked;
            blocked.push(task.id.clone());
        }
    }
    blocked
}

fn block_pending(tasks: &mut [Task]) -> Vec<String> {
    tasks
        .iter_mut()
        .filter(|task| task.status == TaskStatus::Pending)
        .map(|task| {
            task.status = TaskStatus::Blocked;
            task.id.clone()
        })
        .collect()
}

/// Stalled tasks that sit on a dependency cycle, in document order.
fn cycle_members(tasks: &[Task], stalled: &[String]) -> Vec<String> {
    let stalled_set: HashSet<&str> = stalled.iter().map(String::as_str).collect();
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for task in tasks.iter().filter(|t| stalled_set.contains(t.id.as_str())) {
        graph.add_node(task.id.as_str());
        for dep in &task.depends_on {
            if stalled_set.contains(dep.as_str()) {
                graph.add_edge(dep.as_str(), task.id.as_str(), ());
            }
        }
    }

    let mut on_cycle: HashSet<&str> = HashSet::new();
    for component in tarjan_scc(&graph) {
        let self_loop = component.len() == 1 && graph.contains_edge(component[0], component[0]);
        if component.len() > 1 || self_loop {
            on_cycle.extend(component);
        }
    }
    tasks
        .iter()
        .filter(|task| on_cycle.contains(task.id.as_str()))
        .map(|task| task.id.clone())
        .collect()
}

/// Phase name if the task at `index` just completed its phase.
fn completed_phase(tasks: &[Task], index: usize) -> Option<String> {
    let phase = tasks[index].phase.as_ref()?;
    tasks
        .iter()
        .filter(|task| task.phase.as_ref() == Some(phase))
        .all(|task| task.status == TaskStatus::Completed)
        .then(|| phase.clone())
}

fn failure_message(err: OrchestratorError) -> String {
    match err {
        OrchestratorError::TaskFailed { message, .. } => message,
        other => other.to_string(),
    }
}
