//! Deterministic task selection.

use crate::core::ordering::{IdScheme, compare_tasks};
use crate::task::{Task, TaskStatus};

/// First `Pending` task in execution order, or `None` when nothing is runnable.
pub fn next_eligible(tasks: &[Task], scheme: IdScheme) -> Option<&Task> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .min_by(|a, b| compare_tasks(scheme, a, b))
}

pub fn in_progress(tasks: &[Task]) -> Option<&Task> {
    tasks.iter().find(|t| t.status == TaskStatus::InProgress)
}

/// Failed tasks in execution order.
pub fn failed(tasks: &[Task], scheme: IdScheme) -> Vec<&Task> {
    let mut failed: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();
    failed.sort_by(|a, b| compare_tasks(scheme, a, b));
    failed
}

/// True once a task has used its whole retry budget.
pub fn at_retry_ceiling(task: &Task, max_task_retries: u32) -> bool {
    task.retries >= max_task_retries
}
