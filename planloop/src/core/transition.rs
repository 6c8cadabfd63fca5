//! Engine-owned task state transitions.
//!
//! Permitted edges:
//!
//! ```text
//! pending     -> in_progress   (single in-flight)
//! in_progress -> completed
//! in_progress -> failed        (requires an error message)
//! in_progress -> pending       (safe abort, crash recovery)
//! failed      -> pending       (re-plan or reset)
//! ```
//!
//! Everything else is an [`EngineError::InvalidTransition`].

use crate::core::error::EngineError;
use crate::task::{Task, TaskStatus};

/// Extra data carried by a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    /// Required when entering `failed`; ignored otherwise.
    pub error_message: Option<String>,
    /// Recorded on the task when present; an existing id is kept otherwise.
    pub session_id: Option<String>,
}

impl TransitionFields {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

pub fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::InProgress)
            | (TaskStatus::InProgress, TaskStatus::Completed)
            | (TaskStatus::InProgress, TaskStatus::Failed)
            | (TaskStatus::InProgress, TaskStatus::Pending)
            | (TaskStatus::Failed, TaskStatus::Pending)
    )
}

/// Apply one transition to the task with `id` inside `tasks`.
///
/// On error the list is left untouched.
pub fn apply_transition(
    tasks: &mut [Task],
    id: &str,
    to: TaskStatus,
    fields: TransitionFields,
) -> Result<(), EngineError> {
    let index = tasks
        .iter()
        .position(|t| t.id == id)
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
    let from = tasks[index].status;
    let invalid = |reason: String| EngineError::InvalidTransition {
        id: id.to_string(),
        from,
        to,
        reason,
    };

    if !is_allowed(from, to) {
        return Err(invalid("edge not permitted".to_string()));
    }
    if to == TaskStatus::InProgress
        && let Some(active) = tasks
            .iter()
            .find(|t| t.status == TaskStatus::InProgress && t.id != id)
    {
        return Err(invalid(format!("task '{}' is already in progress", active.id)));
    }

    let error_message = if to == TaskStatus::Failed {
        let message = fields
            .error_message
            .as_deref()
            .map(str::trim)
            .filter(|msg| !msg.is_empty())
            .ok_or_else(|| invalid("failed requires a non-empty error message".to_string()))?;
        Some(message.to_string())
    } else {
        None
    };

    let task = &mut tasks[index];
    task.status = to;
    task.error_message = error_message;
    if let Some(session_id) = fields.session_id {
        task.session_id = Some(session_id);
    }
    Ok(())
}

/// How much of a task's history a reset discards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Back to `pending`; keeps notes and the retry counter.
    Single,
    /// Back to a pristine `pending` task.
    Full,
}

/// Operator-initiated reset; bypasses the edge table.
pub fn reset_task(task: &mut Task, scope: ResetScope) {
    task.status = TaskStatus::Pending;
    task.error_message = None;
    task.session_id = None;
    if scope == ResetScope::Full {
        task.notes = None;
        task.retries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failed_task, task, with_status};

    const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    #[test]
    fn edge_table_matches_lifecycle() {
        let allowed: Vec<(TaskStatus, TaskStatus)> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| is_allowed(*from, *to))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (TaskStatus::Pending, TaskStatus::InProgress),
                (TaskStatus::InProgress, TaskStatus::Pending),
                (TaskStatus::InProgress, TaskStatus::Completed),
                (TaskStatus::InProgress, TaskStatus::Failed),
                (TaskStatus::Failed, TaskStatus::Pending),
            ]
        );
    }

    #[test]
    fn completed_is_terminal() {
        let mut tasks = vec![with_status("1", TaskStatus::Completed)];
        let err = apply_transition(
            &mut tasks,
            "1",
            TaskStatus::InProgress,
            TransitionFields::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }

    #[test]
    fn second_in_progress_is_rejected() {
        let mut tasks = vec![with_status("1", TaskStatus::InProgress), task("2")];
        let err = apply_transition(
            &mut tasks,
            "2",
            TaskStatus::InProgress,
            TransitionFields::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("already in progress"));
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn failing_requires_message_and_records_it() {
        let mut tasks = vec![with_status("1", TaskStatus::InProgress)];
        let err = apply_transition(
            &mut tasks,
            "1",
            TaskStatus::Failed,
            TransitionFields::failure("   "),
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-empty error message"));

        apply_transition(
            &mut tasks,
            "1",
            TaskStatus::Failed,
            TransitionFields::failure("tests failed").with_session(Some("s-1".to_string())),
        )
        .expect("fail task");
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(tasks[0].error_message.as_deref(), Some("tests failed"));
        assert_eq!(tasks[0].session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn leaving_failed_clears_error() {
        let mut tasks = vec![failed_task("1", "boom", 1)];
        apply_transition(
            &mut tasks,
            "1",
            TaskStatus::Pending,
            TransitionFields::default(),
        )
        .expect("retry");
        assert_eq!(tasks[0].error_message, None);
        assert_eq!(tasks[0].retries, 1);
    }

    #[test]
    fn unknown_task_is_not_found() {
        let mut tasks = vec![task("1")];
        let err = apply_transition(
            &mut tasks,
            "9",
            TaskStatus::InProgress,
            TransitionFields::default(),
        )
        .unwrap_err();
        assert_eq!(err, EngineError::NotFound("9".to_string()));
    }

    #[test]
    fn full_reset_clears_history() {
        let mut single = failed_task("1", "boom", 2);
        single.notes = Some("tried twice".to_string());
        let mut full = single.clone();

        reset_task(&mut single, ResetScope::Single);
        reset_task(&mut full, ResetScope::Full);

        assert_eq!(single.status, TaskStatus::Pending);
        assert_eq!(single.retries, 2);
        assert!(single.notes.is_some());
        assert_eq!(full.retries, 0);
        assert_eq!(full.notes, None);
        assert_eq!(full.error_message, None);
    }
}
