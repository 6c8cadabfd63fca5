//! Completion gate: turns a finished session into `completed` or `failed`.
//!
//! Only a session that ended successfully is validated. A passing validation
//! is committed before the task is marked complete, so a completed task
//! always has exactly one commit on top of its snapshot. Failed validation
//! leaves the working tree as the session left it for the re-planner to see.
//! An operator interrupt raised while validating wins over the verdict: the
//! gate records nothing and the caller rolls the task back.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::monitor::StallReason;
use crate::core::transition::TransitionFields;
use crate::core::types::{CommitRef, FailureKind, SessionOutcome, Verdict};
use crate::io::git::VersionControl;
use crate::io::interrupt::InterruptFlag;
use crate::io::progress_log::{JournalEntry, JournalEvent, ProgressLog};
use crate::io::session::SessionReport;
use crate::io::task_store::TaskStore;
use crate::io::validator::{ValidationRequest, Validator};
use crate::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Completed { commit: CommitRef },
    Failed { kind: FailureKind, message: String },
}

impl GateOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, GateOutcome::Completed { .. })
    }
}

/// Collaborators the gate needs to judge one session.
pub struct Gate<'a, V, C> {
    pub validator: &'a V,
    pub validation: &'a ValidationRequest,
    pub vcs: &'a C,
    pub journal: &'a ProgressLog,
    pub interrupt: &'a InterruptFlag,
}

impl<V: Validator, C: VersionControl> Gate<'_, V, C> {
    /// Judge `report` for the in-progress task `task_id` and persist the result.
    ///
    /// `stall` is the monitor's reason when the engine cancelled the session.
    /// Returns `None` when an interrupt arrived before a verdict was
    /// recorded; the task is then still `in_progress`.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub fn complete_task(
        &self,
        store: &mut TaskStore,
        task_id: &str,
        report: &SessionReport,
        stall: Option<&StallReason>,
    ) -> Result<Option<GateOutcome>> {
        if let Some(notes) = &report.notes {
            store.set_notes(task_id, notes)?;
        }
        let description = store.require(task_id)?.description.clone();
        let session_id = report.session_id.as_deref();

        let (kind, detail) = match &report.outcome {
            SessionOutcome::Cancelled => match stall {
                Some(reason) => (FailureKind::Stall, reason.to_string()),
                None => (FailureKind::Cancelled, String::new()),
            },
            SessionOutcome::Failure(reason) => (FailureKind::Session, reason.clone()),
            SessionOutcome::Success => match run_validation(self.validator, self.validation) {
                // The validator may have died from the same Ctrl+C.
                _ if self.interrupt.is_raised() => {
                    warn!("interrupt during validation, no verdict recorded");
                    return Ok(None);
                }
                Verdict::Fail(diagnostic) => (FailureKind::Validation, diagnostic),
                Verdict::Pass => {
                    let message = format!("Complete task [{task_id}]: {description}");
                    match self.vcs.commit(&message) {
                        Ok(commit) => {
                            store.transition(
                                task_id,
                                TaskStatus::Completed,
                                TransitionFields::default()
                                    .with_session(report.session_id.clone()),
                            )?;
                            info!(commit = %commit.short(), "task completed");
                            record(
                                self.journal,
                                task_id,
                                &description,
                                JournalEvent::Completed,
                                session_id,
                                &format!("commit {}", commit.short()),
                            );
                            return Ok(Some(GateOutcome::Completed { commit }));
                        }
                        Err(err) => (FailureKind::Commit, format!("{err:#}")),
                    }
                }
            },
        };

        let message = kind.describe(&detail);
        store.transition(
            task_id,
            TaskStatus::Failed,
            TransitionFields::failure(message.clone()).with_session(report.session_id.clone()),
        )?;
        warn!(kind = ?kind, "task failed");
        record(
            self.journal,
            task_id,
            &description,
            JournalEvent::Failed,
            session_id,
            &message,
        );
        Ok(Some(GateOutcome::Failed { kind, message }))
    }
}

/// A validator that cannot run counts as a failed validation.
fn run_validation<V: Validator>(validator: &V, request: &ValidationRequest) -> Verdict {
    match validator.validate(request) {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "validation could not run");
            Verdict::Fail(format!("validation could not run: {err:#}"))
        }
    }
}

/// Journal writes are best effort; the task store is the source of truth.
pub(crate) fn record(
    journal: &ProgressLog,
    task_id: &str,
    description: &str,
    event: JournalEvent,
    session_id: Option<&str>,
    details: &str,
) {
    let entry = JournalEntry {
        task_id,
        description,
        event,
        session_id,
        details,
    };
    if let Err(err) = journal.append(&entry) {
        warn!(err = %format!("{err:#}"), "failed to append progress journal");
    }
}
