//! The control loop behind `planloop run`.
//!
//! Each cycle either re-plans (when tasks are failed) or executes the next
//! eligible task: snapshot, `in_progress`, session under supervision, then
//! the completion gate. The loop stops when nothing is left to do, a ceiling
//! is hit, `--max-tasks` is reached, or the operator interrupts.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, instrument, warn};

use crate::core::monitor::StallReason;
use crate::core::replan::ReplanSummary;
use crate::core::selector::at_retry_ceiling;
use crate::core::transition::TransitionFields;
use crate::core::types::{CommitRef, SessionOutcome};
use crate::gate::{Gate, GateOutcome, record};
use crate::io::analyzer::{CommandAnalyzer, StallAnalyzer};
use crate::io::config::PlanConfig;
use crate::io::cost_ledger::{CostEntry, CostLedger, CostSource, CostSummary};
use crate::io::git::VersionControl;
use crate::io::init::PlanPaths;
use crate::io::interrupt::InterruptFlag;
use crate::io::progress_log::{JournalEvent, ProgressLog};
use crate::io::replanner::Replanner;
use crate::io::session::{Session, SessionReport, SessionRequest, SessionRunner};
use crate::io::task_store::TaskStore;
use crate::io::validator::{ValidationRequest, Validator};
use crate::replan::{ReplanEnv, run_replan_cycle};
use crate::status::FailedTask;
use crate::supervise::{Escalation, MonitorConfig, MonitorHandle, spawn_monitor};
use crate::task::{Task, TaskStatus};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stop after this many task executions.
    pub max_tasks: Option<u32>,
    pub max_task_retries: u32,
    pub max_replan_cycles: u32,
    pub progress_entries: usize,
    pub monitor: MonitorConfig,
    /// Asked before a suspected loop is cancelled.
    pub analyzer: Option<Arc<dyn StallAnalyzer>>,
    pub validation_timeout: Option<Duration>,
    pub validation_output_limit_bytes: usize,
    /// How often the loop polls the session and the interrupt flag.
    pub poll_interval: Duration,
}

impl RunOptions {
    pub fn from_config(config: &PlanConfig, max_tasks: Option<u32>) -> Self {
        Self {
            max_tasks,
            max_task_retries: config.max_task_retries,
            max_replan_cycles: config.max_replan_cycles,
            progress_entries: config.progress_entries,
            monitor: MonitorConfig::from_config(config),
            analyzer: CommandAnalyzer::from_settings(&config.monitor)
                .map(|analyzer| Arc::new(analyzer) as Arc<dyn StallAnalyzer>),
            validation_timeout: config.validate.timeout(),
            validation_output_limit_bytes: config.validate.output_limit_bytes,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Everything outside the engine that a run talks to.
pub struct Collaborators<'a, S, V, P, C> {
    pub runner: &'a S,
    pub validator: &'a V,
    pub replanner: &'a P,
    pub vcs: &'a C,
    pub ledger: &'a CostLedger,
    pub journal: &'a ProgressLog,
    pub interrupt: &'a InterruptFlag,
}

/// Run state threaded through the loop. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    pub current_task: Option<String>,
    /// Re-planning cycles since the last completed task.
    pub replan_cycles: u32,
    pub replan_invocations: u32,
    pub last_good: Option<CommitRef>,
    pub tasks_processed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// Too many consecutive re-planning cycles without a completed task.
    RunCeilingExceeded { cycles: u32, max: u32 },
    /// A re-planning cycle changed nothing and every failed task is at its
    /// retry ceiling.
    RetryBudgetExhausted,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::RunCeilingExceeded { cycles, max } => write!(
                f,
                "re-planning ceiling reached ({cycles}/{max} cycles without progress)"
            ),
            HaltReason::RetryBudgetExhausted => {
                f.write_str("every failed task has exhausted its retries")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStop {
    /// No pending or failed tasks remain.
    Complete,
    MaxTasksReached,
    Halted {
        reason: HaltReason,
        failed: Vec<FailedTask>,
    },
    /// Operator interrupt. `restored` is true only when a task was rolled
    /// back to its snapshot successfully.
    Interrupted {
        task_id: Option<String>,
        restored: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub stop: RunStop,
    pub tasks_processed: u32,
    pub replan_invocations: u32,
    pub recovered: Option<String>,
    pub cost: CostSummary,
}

/// Progress notifications for the CLI.
#[derive(Debug)]
pub enum LoopEvent<'a> {
    Recovered { task_id: &'a str },
    TaskStarted { task: &'a Task },
    TaskFinished { task_id: &'a str, outcome: &'a GateOutcome },
    Replanned { cycle: u32, summary: &'a ReplanSummary },
}

enum TaskRun {
    Finished(GateOutcome),
    Interrupted { restored: bool },
}

/// Drive the task list until it completes or the run has to stop.
#[instrument(skip_all, fields(root = %paths.root.display(), max_tasks = ?options.max_tasks))]
pub fn run_loop<S, V, P, C, F>(
    paths: &PlanPaths,
    store: &mut TaskStore,
    collab: &Collaborators<'_, S, V, P, C>,
    options: &RunOptions,
    mut on_event: F,
) -> Result<RunOutcome>
where
    S: SessionRunner,
    V: Validator,
    P: Replanner,
    C: VersionControl,
    F: FnMut(&LoopEvent<'_>),
{
    let recovered = store.recover_interrupted()?;
    if let Some(id) = &recovered {
        let description = store.require(id)?.description.clone();
        record(
            collab.journal,
            id,
            &description,
            JournalEvent::Interrupted,
            None,
            "recovered after an abrupt stop, back to pending",
        );
        on_event(&LoopEvent::Recovered { task_id: id });
    }

    let mut ctx = RunContext {
        last_good: Some(collab.vcs.current_ref()?),
        ..RunContext::default()
    };
    let replan_env = ReplanEnv {
        workdir: &paths.root,
        scratch_dir: &paths.replan_dir,
        max_task_retries: options.max_task_retries,
    };

    let stop = loop {
        if collab.interrupt.is_raised() {
            break RunStop::Interrupted {
                task_id: None,
                restored: false,
            };
        }

        if !store.failed().is_empty() {
            if ctx.replan_cycles >= options.max_replan_cycles {
                break halted(
                    store,
                    HaltReason::RunCeilingExceeded {
                        cycles: ctx.replan_cycles,
                        max: options.max_replan_cycles,
                    },
                );
            }
            ctx.replan_cycles += 1;
            ctx.replan_invocations += 1;
            let summary = run_replan_cycle(
                store,
                collab.replanner,
                collab.ledger,
                collab.journal,
                &replan_env,
                ctx.replan_invocations,
            )?;
            on_event(&LoopEvent::Replanned {
                cycle: ctx.replan_invocations,
                summary: &summary,
            });
            let failed = store.failed();
            if summary.applied() == 0
                && !failed.is_empty()
                && failed
                    .iter()
                    .all(|t| at_retry_ceiling(t, options.max_task_retries))
            {
                break halted(store, HaltReason::RetryBudgetExhausted);
            }
            continue;
        }

        if let Some(max) = options.max_tasks
            && ctx.tasks_processed >= max
        {
            break RunStop::MaxTasksReached;
        }

        let Some(task) = store.next_eligible().cloned() else {
            break RunStop::Complete;
        };
        on_event(&LoopEvent::TaskStarted { task: &task });
        ctx.current_task = Some(task.id.clone());
        let run = execute_task(paths, store, collab, options, &task)?;
        ctx.current_task = None;
        ctx.tasks_processed += 1;
        match run {
            TaskRun::Finished(outcome) => {
                if let GateOutcome::Completed { commit } = &outcome {
                    ctx.replan_cycles = 0;
                    ctx.last_good = Some(commit.clone());
                }
                on_event(&LoopEvent::TaskFinished {
                    task_id: &task.id,
                    outcome: &outcome,
                });
            }
            TaskRun::Interrupted { restored } => {
                break RunStop::Interrupted {
                    task_id: Some(task.id.clone()),
                    restored,
                };
            }
        }
    };

    info!(
        stop = ?stop,
        tasks_processed = ctx.tasks_processed,
        replan_invocations = ctx.replan_invocations,
        last_good = ?ctx.last_good.as_ref().map(CommitRef::short),
        "run finished"
    );
    Ok(RunOutcome {
        stop,
        tasks_processed: ctx.tasks_processed,
        replan_invocations: ctx.replan_invocations,
        recovered,
        cost: collab.ledger.summary(),
    })
}

fn halted(store: &TaskStore, reason: HaltReason) -> RunStop {
    warn!(reason = %reason, "run halted");
    RunStop::Halted {
        reason,
        failed: store.failed().into_iter().map(FailedTask::from_task).collect(),
    }
}

/// Run one task from snapshot to a terminal state (or back to pending on
/// interrupt).
#[instrument(skip_all, fields(task_id = %task.id))]
fn execute_task<S, V, P, C>(
    paths: &PlanPaths,
    store: &mut TaskStore,
    collab: &Collaborators<'_, S, V, P, C>,
    options: &RunOptions,
    task: &Task,
) -> Result<TaskRun>
where
    S: SessionRunner,
    V: Validator,
    P: Replanner,
    C: VersionControl,
{
    let snapshot = collab.vcs.snapshot().context("snapshot before task")?;
    let recent_progress = collab.journal.recent(options.progress_entries)?;
    store.transition(&task.id, TaskStatus::InProgress, TransitionFields::default())?;
    record(
        collab.journal,
        &task.id,
        &task.description,
        JournalEvent::Started,
        task.session_id.as_deref(),
        &format!("snapshot {}", snapshot.short()),
    );
    info!(snapshot = %snapshot.short(), "task started");

    let log_dir = paths.task_dir(&task.id);
    let request = SessionRequest {
        workdir: paths.root.clone(),
        task: store.require(&task.id)?.clone(),
        recent_progress,
        log_dir: log_dir.clone(),
    };
    let validation = ValidationRequest {
        workdir: paths.root.clone(),
        log_path: log_dir.join("validation.log"),
        timeout: options.validation_timeout,
        output_limit_bytes: options.validation_output_limit_bytes,
    };
    let gate = Gate {
        validator: collab.validator,
        validation: &validation,
        vcs: collab.vcs,
        journal: collab.journal,
        interrupt: collab.interrupt,
    };

    let mut session = match collab.runner.start(&request) {
        Ok(session) => session,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "session did not start");
            let report = SessionReport {
                outcome: SessionOutcome::Failure(format!(
                    "could not start session: {err:#}"
                )),
                session_id: task.session_id.clone(),
                cost: None,
                notes: None,
            };
            return finish_task(store, collab, &gate, task, &snapshot, &report, None);
        }
    };

    let escalation = options.analyzer.as_ref().map(|analyzer| Escalation {
        analyzer: Arc::clone(analyzer),
        workdir: paths.root.clone(),
        description: task.description.clone(),
    });
    let monitor = spawn_monitor(session.progress(), options.monitor, &task.id, escalation)?;
    let (report, stall) = loop {
        if collab.interrupt.is_raised() {
            stop_monitor(monitor);
            let restored = safe_abort(store, collab, session.as_mut(), task, &snapshot)?;
            return Ok(TaskRun::Interrupted { restored });
        }
        if let Some(reason) = monitor.intervention() {
            warn!(reason = %reason, "cancelling stalled session");
            break (cancel_session(session.as_mut()), Some(reason));
        }
        match session.try_finish() {
            Ok(Some(report)) => break (report, None),
            Ok(None) => thread::sleep(options.poll_interval),
            Err(err) => {
                error!(err = %format!("{err:#}"), "session could not be polled");
                let mut report = cancel_session(session.as_mut());
                report.outcome =
                    SessionOutcome::Failure(format!("session could not be polled: {err:#}"));
                break (report, None);
            }
        }
    };
    stop_monitor(monitor);
    record_session_cost(collab.ledger, &task.id, &report);

    finish_task(store, collab, &gate, task, &snapshot, &report, stall.as_ref())
}

/// Hand the report to the gate unless the operator interrupted first, in
/// which case the task is rolled back instead of judged.
fn finish_task<S, V, P, C>(
    store: &mut TaskStore,
    collab: &Collaborators<'_, S, V, P, C>,
    gate: &Gate<'_, V, C>,
    task: &Task,
    snapshot: &CommitRef,
    report: &SessionReport,
    stall: Option<&StallReason>,
) -> Result<TaskRun>
where
    V: Validator,
    C: VersionControl,
{
    if !collab.interrupt.is_raised()
        && let Some(outcome) = gate.complete_task(store, &task.id, report, stall)?
    {
        return Ok(TaskRun::Finished(outcome));
    }
    warn!("interrupt received after the session ended, aborting task");
    let restored = abort_task(store, collab, task, snapshot, report.session_id.clone())?;
    Ok(TaskRun::Interrupted { restored })
}

/// Stop the session, falling back to what its progress saw when it will not
/// stop cleanly.
fn cancel_session(session: &mut dyn Session) -> SessionReport {
    match session.cancel() {
        Ok(report) => report,
        Err(err) => {
            error!(err = %format!("{err:#}"), "session did not stop cleanly");
            session.progress().report(SessionOutcome::Cancelled)
        }
    }
}

fn stop_monitor(monitor: MonitorHandle) {
    if let Err(err) = monitor.stop() {
        warn!(err = %format!("{err:#}"), "monitor did not stop cleanly");
    }
}

/// Cancel, roll back to `snapshot`, and put the task back to `pending`.
fn safe_abort<S, V, P, C>(
    store: &mut TaskStore,
    collab: &Collaborators<'_, S, V, P, C>,
    session: &mut dyn Session,
    task: &Task,
    snapshot: &CommitRef,
) -> Result<bool>
where
    C: VersionControl,
{
    warn!("interrupt received, aborting task");
    let report = cancel_session(session);
    record_session_cost(collab.ledger, &task.id, &report);
    abort_task(store, collab, task, snapshot, report.session_id)
}

/// Roll back to `snapshot` and return the task to `pending`.
///
/// A failed rollback is logged and the task is still returned to `pending`;
/// the result says whether the working tree was restored.
fn abort_task<S, V, P, C>(
    store: &mut TaskStore,
    collab: &Collaborators<'_, S, V, P, C>,
    task: &Task,
    snapshot: &CommitRef,
    session_id: Option<String>,
) -> Result<bool>
where
    C: VersionControl,
{
    let restored = match collab.vcs.rollback(snapshot) {
        Ok(()) => true,
        Err(err) => {
            error!(err = %format!("{err:#}"), "rollback failed");
            false
        }
    };
    store.transition(
        &task.id,
        TaskStatus::Pending,
        TransitionFields::default().with_session(session_id.clone()),
    )?;
    let details = if restored {
        format!("rolled back to {}", snapshot.short())
    } else {
        format!("rollback to {} failed", snapshot.short())
    };
    record(
        collab.journal,
        &task.id,
        &task.description,
        JournalEvent::Interrupted,
        session_id.as_deref(),
        &details,
    );
    Ok(restored)
}

fn record_session_cost(ledger: &CostLedger, task_id: &str, report: &SessionReport) {
    if let Some(cost) = report.cost {
        ledger.append(CostEntry {
            source: CostSource::Session,
            amount_usd: cost.usd,
            task_id: Some(task_id.to_string()),
            estimated: cost.estimated,
            details: String::new(),
        });
    }
}
