//! Re-planning decisions and the legality rules applied to them.
//!
//! A re-planner may propose anything; only decisions that target a `failed`
//! task are applied, and retry or modify only below the retry ceiling. The
//! rest are returned as rejections for the caller to log.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::error::EngineError;
use crate::core::ordering::allocate_child_ids;
use crate::core::selector::at_retry_ceiling;
use crate::core::transition::{TransitionFields, apply_transition};
use crate::task::{Task, TaskStatus};

/// One re-planning decision as produced by a re-planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplanDecision {
    pub task_id: String,
    #[serde(flatten)]
    pub action: ReplanAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReplanAction {
    /// Try the same task again unchanged.
    Retry,
    /// Rewrite parts of the task, then try again.
    Modify {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        steps: Option<Vec<String>>,
        #[serde(default)]
        notes: Option<String>,
    },
    /// Replace the task with smaller subtasks.
    Split { subtasks: Vec<SubtaskSpec> },
    /// Drop the task from the plan.
    Delete {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ReplanAction {
    pub fn name(&self) -> &'static str {
        match self {
            ReplanAction::Retry => "retry",
            ReplanAction::Modify { .. } => "modify",
            ReplanAction::Split { .. } => "split",
            ReplanAction::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub description: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ReplanDecision {
    pub fn retry(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            action: ReplanAction::Retry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnknownTask,
    NotFailed(TaskStatus),
    AlreadyDecided,
    CeilingReached { retries: u32, max: u32 },
    EmptySplit,
    EmptyDescription,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnknownTask => f.write_str("task does not exist"),
            Rejection::NotFailed(status) => write!(f, "task is {status}, not failed"),
            Rejection::AlreadyDecided => f.write_str("task already has a decision this cycle"),
            Rejection::CeilingReached { retries, max } => {
                write!(f, "retry ceiling reached ({retries}/{max})")
            }
            Rejection::EmptySplit => f.write_str("split without subtasks"),
            Rejection::EmptyDescription => f.write_str("empty description"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedDecision {
    pub task_id: String,
    pub action: &'static str,
    pub reason: Rejection,
}

/// What a batch of decisions did to the task list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplanSummary {
    pub retried: Vec<String>,
    pub modified: Vec<String>,
    /// `(parent id, new subtask ids)`.
    pub split: Vec<(String, Vec<String>)>,
    pub deleted: Vec<String>,
    pub rejected: Vec<RejectedDecision>,
}

impl ReplanSummary {
    pub fn applied(&self) -> usize {
        self.retried.len() + self.modified.len() + self.split.len() + self.deleted.len()
    }
}

/// Apply decisions in order. Illegal decisions are skipped and reported.
///
/// Errors only if the transition table itself refuses a move, which the
/// legality checks make unreachable for well-formed lists.
pub fn apply_decisions(
    tasks: &mut Vec<Task>,
    decisions: &[ReplanDecision],
    max_task_retries: u32,
) -> Result<ReplanSummary, EngineError> {
    let mut summary = ReplanSummary::default();
    let mut decided: HashSet<String> = HashSet::new();

    for decision in decisions {
        if let Err(reason) = check_legal(tasks, decision, &decided, max_task_retries) {
            summary.rejected.push(RejectedDecision {
                task_id: decision.task_id.clone(),
                action: decision.action.name(),
                reason,
            });
            continue;
        }
        decided.insert(decision.task_id.clone());
        let id = decision.task_id.as_str();

        match &decision.action {
            ReplanAction::Retry => {
                requeue(tasks, id)?;
                summary.retried.push(id.to_string());
            }
            ReplanAction::Modify {
                description,
                steps,
                notes,
            } => {
                if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
                    if let Some(description) = description {
                        task.description = description.trim().to_string();
                    }
                    if let Some(steps) = steps {
                        task.steps = steps.clone();
                    }
                    if let Some(notes) = notes {
                        task.notes = Some(notes.clone());
                    }
                }
                requeue(tasks, id)?;
                summary.modified.push(id.to_string());
            }
            ReplanAction::Split { subtasks } => {
                let Some(index) = tasks.iter().position(|t| t.id == id) else {
                    continue;
                };
                let parent = tasks.remove(index);
                let ids = allocate_child_ids(&parent.id, tasks, subtasks.len());
                for (child_id, spec) in ids.iter().zip(subtasks) {
                    let mut child = Task::new(child_id.clone(), spec.description.trim());
                    child.priority = parent.priority;
                    child.steps = spec.steps.clone();
                    child.notes = spec.notes.clone();
                    tasks.push(child);
                }
                summary.split.push((parent.id, ids));
            }
            ReplanAction::Delete { .. } => {
                tasks.retain(|t| t.id != id);
                summary.deleted.push(id.to_string());
            }
        }
    }

    Ok(summary)
}

fn check_legal(
    tasks: &[Task],
    decision: &ReplanDecision,
    decided: &HashSet<String>,
    max_task_retries: u32,
) -> Result<(), Rejection> {
    if decided.contains(&decision.task_id) {
        return Err(Rejection::AlreadyDecided);
    }
    let task = tasks
        .iter()
        .find(|t| t.id == decision.task_id)
        .ok_or(Rejection::UnknownTask)?;
    if task.status != TaskStatus::Failed {
        return Err(Rejection::NotFailed(task.status));
    }
    let requeues = matches!(
        decision.action,
        ReplanAction::Retry | ReplanAction::Modify { .. }
    );
    if requeues && at_retry_ceiling(task, max_task_retries) {
        return Err(Rejection::CeilingReached {
            retries: task.retries,
            max: max_task_retries,
        });
    }
    match &decision.action {
        ReplanAction::Split { subtasks } => {
            if subtasks.is_empty() {
                return Err(Rejection::EmptySplit);
            }
            if subtasks.iter().any(|s| s.description.trim().is_empty()) {
                return Err(Rejection::EmptyDescription);
            }
        }
        ReplanAction::Modify {
            description: Some(description),
            ..
        } if description.trim().is_empty() => return Err(Rejection::EmptyDescription),
        _ => {}
    }
    Ok(())
}

/// `failed -> pending`, consuming one retry and dropping the stale session.
fn requeue(tasks: &mut [Task], id: &str) -> Result<(), EngineError> {
    apply_transition(tasks, id, TaskStatus::Pending, TransitionFields::default())?;
    if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
        task.retries += 1;
        task.session_id = None;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failed_task, prioritized, task, with_status};

    fn split(id: &str, descriptions: &[&str]) -> ReplanDecision {
        ReplanDecision {
            task_id: id.to_string(),
            action: ReplanAction::Split {
                subtasks: descriptions
                    .iter()
                    .map(|d| SubtaskSpec {
                        description: d.to_string(),
                        steps: Vec::new(),
                        notes: None,
                    })
                    .collect(),
            },
        }
    }

    #[test]
    fn retry_requeues_and_counts() {
        let mut tasks = vec![failed_task("1", "tests failed", 0)];
        tasks[0].session_id = Some("s-1".to_string());

        let summary =
            apply_decisions(&mut tasks, &[ReplanDecision::retry("1")], 3).expect("apply");

        assert_eq!(summary.retried, vec!["1".to_string()]);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].retries, 1);
        assert_eq!(tasks[0].error_message, None);
        assert_eq!(tasks[0].session_id, None);
    }

    #[test]
    fn modify_rewrites_fields_before_requeue() {
        let mut tasks = vec![failed_task("1", "tests failed", 1)];
        let decision = ReplanDecision {
            task_id: "1".to_string(),
            action: ReplanAction::Modify {
                description: Some("smaller scope".to_string()),
                steps: Some(vec!["only the parser".to_string()]),
                notes: Some("lexer already done".to_string()),
            },
        };

        apply_decisions(&mut tasks, &[decision], 3).expect("apply");

        assert_eq!(tasks[0].description, "smaller scope");
        assert_eq!(tasks[0].steps, vec!["only the parser".to_string()]);
        assert_eq!(tasks[0].notes.as_deref(), Some("lexer already done"));
        assert_eq!(tasks[0].retries, 2);
    }

    #[test]
    fn split_replaces_parent_with_ordered_children() {
        let mut tasks = vec![
            with_status("1", TaskStatus::Completed),
            failed_task("2", "too big", 0),
            task("2.1"),
            task("3"),
        ];

        let summary =
            apply_decisions(&mut tasks, &[split("2", &["first half", "second half"])], 3)
                .expect("apply");

        assert_eq!(
            summary.split,
            vec![("2".to_string(), vec!["2.2".to_string(), "2.3".to_string()])]
        );
        assert!(tasks.iter().all(|t| t.id != "2"));
        let child = tasks.iter().find(|t| t.id == "2.2").expect("child");
        assert_eq!(child.status, TaskStatus::Pending);
        assert_eq!(child.retries, 0);
        assert_eq!(child.description, "first half");
    }

    #[test]
    fn split_children_inherit_priority() {
        let mut parent = prioritized("db", 4);
        parent.status = TaskStatus::Failed;
        parent.error_message = Some("boom".to_string());
        let mut tasks = vec![parent];

        apply_decisions(&mut tasks, &[split("db", &["schema"])], 3).expect("apply");

        assert_eq!(tasks[0].id, "db.1");
        assert_eq!(tasks[0].priority, Some(4));
    }

    #[test]
    fn delete_removes_task() {
        let mut tasks = vec![failed_task("1", "obsolete", 0), task("2")];
        let decision = ReplanDecision {
            task_id: "1".to_string(),
            action: ReplanAction::Delete {
                reason: Some("no longer needed".to_string()),
            },
        };
        let summary = apply_decisions(&mut tasks, &[decision], 3).expect("apply");
        assert_eq!(summary.deleted, vec!["1".to_string()]);
        assert_eq!(tasks.len(), 1);
    }

    #[test]
    fn illegal_decisions_are_rejected_individually() {
        let mut tasks = vec![
            with_status("1", TaskStatus::Completed),
            failed_task("2", "boom", 3),
            failed_task("3", "boom", 0),
        ];
        let decisions = vec![
            ReplanDecision::retry("1"),
            ReplanDecision::retry("2"),
            ReplanDecision::retry("9"),
            split("3", &[]),
            ReplanDecision::retry("3"),
            ReplanDecision::retry("3"),
        ];

        let summary = apply_decisions(&mut tasks, &decisions, 3).expect("apply");

        assert_eq!(summary.retried, vec!["3".to_string()]);
        let reasons: Vec<&Rejection> = summary.rejected.iter().map(|r| &r.reason).collect();
        assert_eq!(
            reasons,
            vec![
                &Rejection::NotFailed(TaskStatus::Completed),
                &Rejection::CeilingReached { retries: 3, max: 3 },
                &Rejection::UnknownTask,
                &Rejection::EmptySplit,
                &Rejection::AlreadyDecided,
            ]
        );
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[1].status, TaskStatus::Failed);
    }

    /// Verifies the ceiling only blocks decisions that put the same task back
    /// in the queue.
    #[test]
    fn split_and_delete_remain_legal_at_ceiling() {
        let mut tasks = vec![failed_task("1", "boom", 3), failed_task("2", "boom", 3)];
        let decisions = vec![
            split("1", &["smaller"]),
            ReplanDecision {
                task_id: "2".to_string(),
                action: ReplanAction::Delete { reason: None },
            },
        ];

        let summary = apply_decisions(&mut tasks, &decisions, 3).expect("apply");

        assert!(summary.rejected.is_empty());
        assert_eq!(summary.deleted, vec!["2".to_string()]);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "1.1");
        assert_eq!(tasks[0].retries, 0);
    }

    #[test]
    fn decisions_deserialize_from_tagged_json() {
        let decisions: Vec<ReplanDecision> = serde_json::from_str(
            r#"[
                {"task_id": "1", "action": "retry"},
                {"task_id": "2", "action": "modify", "notes": "use sqlite"},
                {"task_id": "3", "action": "split", "subtasks": [{"description": "a"}]},
                {"task_id": "4", "action": "delete"}
            ]"#,
        )
        .expect("parse");
        assert_eq!(decisions[0].action, ReplanAction::Retry);
        assert_eq!(
            decisions[1].action,
            ReplanAction::Modify {
                description: None,
                steps: None,
                notes: Some("use sqlite".to_string()),
            }
        );
        assert_eq!(decisions[2].action.name(), "split");
        assert_eq!(decisions[3].action, ReplanAction::Delete { reason: None });
    }
}
