//! Shared deterministic types for the planloop core.
//!
//! These types are the contracts between the control loop and its
//! collaborators (session runner, validator, version control).

use std::fmt;

/// How an agent session ended, as reported by the session runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The session claims the task is done. Still subject to validation.
    Success,
    /// The session ended on its own without finishing the task.
    Failure(String),
    /// The session was stopped by the engine (stall or interrupt).
    Cancelled,
}

/// Result of running the project's validation command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// Diagnostic text shown to the re-planner and recorded on the task.
    Fail(String),
}

/// Recoverable per-task failure categories. Each one ends with the task in
/// `Failed` carrying a message built by [`FailureKind::describe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Session,
    Validation,
    Stall,
    Commit,
    Cancelled,
}

impl FailureKind {
    pub fn describe(self, detail: &str) -> String {
        let detail = detail.trim();
        let label = match self {
            FailureKind::Session => "session failed",
            FailureKind::Validation => "validation failed",
            FailureKind::Stall => "stalled",
            FailureKind::Commit => "commit failed after validation passed",
            FailureKind::Cancelled => "session cancelled",
        };
        if detail.is_empty() {
            label.to_string()
        } else {
            format!("{label}: {detail}")
        }
    }
}

/// Opaque reference to a version-control snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitRef(pub String);

impl CommitRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_prefixes_failure_kind() {
        assert_eq!(
            FailureKind::Validation.describe("  3 tests failed\n"),
            "validation failed: 3 tests failed"
        );
        assert_eq!(FailureKind::Cancelled.describe(""), "session cancelled");
    }

    #[test]
    fn short_ref_handles_short_values() {
        assert_eq!(CommitRef("abcdef0123".to_string()).short(), "abcdef0");
        assert_eq!(CommitRef("abc".to_string()).short(), "abc");
    }
}
