//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::ordering::detect_scheme;
use crate::task::{Task, TaskStatus};

/// Check semantic invariants of a task list:
/// - No duplicate ids
/// - At most one task `in_progress`
/// - Every `failed` task carries a non-empty `error_message`
/// - All ids follow a single scheme
pub fn validate_invariants(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate id '{}'", task.id));
        }
        if task.description.trim().is_empty() {
            errors.push(format!("{}: description must not be empty", task.id));
        }
        if task.status == TaskStatus::Failed
            && task
                .error_message
                .as_deref()
                .is_none_or(|msg| msg.trim().is_empty())
        {
            errors.push(format!("{}: failed task is missing error_message", task.id));
        }
    }

    let active: Vec<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .map(|t| t.id.as_str())
        .collect();
    if active.len() > 1 {
        errors.push(format!(
            "more than one task in_progress: {}",
            active.join(", ")
        ));
    }

    if let Err(err) = detect_scheme(tasks) {
        errors.push(err);
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{prioritized, task, with_status};

    #[test]
    fn valid_list_has_no_errors() {
        let tasks = vec![task("1"), task("1.1"), with_status("2", TaskStatus::InProgress)];
        assert!(validate_invariants(&tasks).is_empty());
    }

    #[test]
    fn reports_duplicates_and_double_in_progress() {
        let tasks = vec![
            with_status("1", TaskStatus::InProgress),
            with_status("1", TaskStatus::InProgress),
        ];
        let errors = validate_invariants(&tasks);
        assert!(errors.iter().any(|e| e.contains("duplicate id '1'")));
        assert!(errors.iter().any(|e| e.contains("more than one task in_progress")));
    }

    #[test]
    fn failed_task_needs_error_message() {
        let tasks = vec![with_status("1", TaskStatus::Failed)];
        let errors = validate_invariants(&tasks);
        assert_eq!(errors, vec!["1: failed task is missing error_message".to_string()]);
    }

    #[test]
    fn mixed_schemes_are_reported() {
        let tasks = vec![task("1"), prioritized("b", 1)];
        let errors = validate_invariants(&tasks);
        assert!(errors.iter().any(|e| e.contains("mixed id schemes")));
    }
}
