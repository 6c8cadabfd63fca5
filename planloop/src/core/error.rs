//! Typed errors raised by the task engine.
//!
//! Only these two are hard failures of the store. Everything a session,
//! validator or commit can do wrong is normalized into a `Failed` task and
//! described by [`crate::core::types::FailureKind`].

use thiserror::Error;

use crate::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid transition for task '{id}' ({from} -> {to}): {reason}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
        reason: String,
    },
    #[error("task '{0}' not found")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_names_both_states() {
        let err = EngineError::InvalidTransition {
            id: "3".to_string(),
            from: TaskStatus::Completed,
            to: TaskStatus::InProgress,
            reason: "edge not permitted".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for task '3' (completed -> in_progress): edge not permitted"
        );
    }
}
