//! Test-only builders, scripted collaborators and a throwaway git repository.
//!
//! Scripted collaborators pop one queued response per call, so a test reads
//! top to bottom as the sequence of things the engine will see.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{CommitRef, SessionOutcome, Verdict};
use crate::io::analyzer::{Analysis, AnalysisRequest, StallAnalyzer};
use crate::io::git::{Git, VersionControl};
use crate::io::init::{InitOptions, PlanPaths, init_workspace};
use crate::io::interrupt::InterruptFlag;
use crate::io::replanner::{ReplanRequest, ReplanResponse, Replanner, RetryPolicy};
use crate::io::session::{
    Session, SessionCost, SessionProgress, SessionReport, SessionRequest, SessionRunner,
};
use crate::io::task_store::TaskStore;
use crate::io::validator::{ValidationRequest, Validator};
use crate::task::{Task, TaskStatus};

/// Pending task with description `task {id}`.
pub fn task(id: &str) -> Task {
    Task::new(id, format!("task {id}"))
}

pub fn prioritized(id: &str, priority: i64) -> Task {
    let mut task = task(id);
    task.priority = Some(priority);
    task
}

pub fn with_status(id: &str, status: TaskStatus) -> Task {
    let mut task = task(id);
    task.status = status;
    task
}

pub fn failed_task(id: &str, error_message: &str, retries: u32) -> Task {
    let mut task = with_status(id, TaskStatus::Failed);
    task.error_message = Some(error_message.to_string());
    task.retries = retries;
    task
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Git repository in a temp dir with one initial commit.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let git = Git::new(dir.path());
        git.init()?;
        git.ensure_identity()?;
        fs::write(dir.path().join("README.md"), "# fixture\n")?;
        git.commit_all("chore: initial commit")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    /// Run `planloop init` semantics against the repository.
    pub fn init_workspace(&self) -> Result<PlanPaths> {
        Ok(init_workspace(self.path(), &InitOptions::default())?.paths)
    }

    /// Initialise the workspace and replace its task list.
    pub fn with_tasks(&self, tasks: Vec<Task>) -> Result<TaskStore> {
        let paths = self.init_workspace()?;
        let store = TaskStore::from_tasks(paths.tasks_path, tasks)?;
        store.save()?;
        Ok(store)
    }

    pub fn load_tasks(&self) -> Result<TaskStore> {
        TaskStore::load(&PlanPaths::new(self.path()).tasks_path)
    }
}

/// How a scripted session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedEnd {
    Finish(SessionOutcome),
    /// Never finishes on its own; only cancellation ends it.
    Hang,
    /// Polling and cancelling both fail, as when the child can't be waited on.
    Error(String),
}

/// One scripted agent session.
#[derive(Debug, Clone)]
pub struct ScriptedSession {
    /// Files written into the workspace when the session starts.
    pub writes: Vec<(String, String)>,
    /// Stream lines fed to the session's progress.
    pub lines: Vec<String>,
    pub end: ScriptedEnd,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    /// Raised when the session starts, as if the operator pressed Ctrl+C.
    pub interrupt: Option<InterruptFlag>,
}

impl ScriptedSession {
    fn ending(end: ScriptedEnd) -> Self {
        Self {
            writes: Vec::new(),
            lines: Vec::new(),
            end,
            session_id: None,
            cost_usd: None,
            interrupt: None,
        }
    }

    pub fn success() -> Self {
        Self::ending(ScriptedEnd::Finish(SessionOutcome::Success))
    }

    pub fn failure(reason: &str) -> Self {
        Self::ending(ScriptedEnd::Finish(SessionOutcome::Failure(
            reason.to_string(),
        )))
    }

    pub fn hang() -> Self {
        Self::ending(ScriptedEnd::Hang)
    }

    pub fn broken(error: &str) -> Self {
        Self::ending(ScriptedEnd::Error(error.to_string()))
    }

    pub fn writing(mut self, path: &str, contents: &str) -> Self {
        self.writes.push((path.to_string(), contents.to_string()));
        self
    }

    pub fn line(mut self, line: &str) -> Self {
        self.lines.push(line.to_string());
        self
    }

    pub fn session_id(mut self, id: &str) -> Self {
        self.session_id = Some(id.to_string());
        self
    }

    pub fn cost(mut self, usd: f64) -> Self {
        self.cost_usd = Some(usd);
        self
    }

    pub fn interrupting(mut self, flag: &InterruptFlag) -> Self {
        self.interrupt = Some(flag.clone());
        self
    }
}

/// What the engine looked like when a scripted session started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    pub task_id: String,
    /// Session id the task carried, i.e. what a real runner would resume.
    pub resumed: Option<String>,
    /// `in_progress` tasks in the persisted task list.
    pub in_progress: usize,
}

#[derive(Debug, Default)]
pub struct ScriptedSessionRunner {
    queue: Mutex<VecDeque<ScriptedSession>>,
    starts: Mutex<Vec<SessionStart>>,
}

impl ScriptedSessionRunner {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            queue: Mutex::new(sessions.into()),
            starts: Mutex::default(),
        }
    }

    pub fn starts(&self) -> Vec<SessionStart> {
        lock(&self.starts).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.queue).len()
    }
}

impl SessionRunner for ScriptedSessionRunner {
    fn start(&self, request: &SessionRequest) -> Result<Box<dyn Session>> {
        let script = lock(&self.queue)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted session left for task {}", request.task.id))?;

        let in_progress = TaskStore::load(&PlanPaths::new(&request.workdir).tasks_path)
            .map(|store| store.stats().in_progress)
            .unwrap_or(0);
        lock(&self.starts).push(SessionStart {
            task_id: request.task.id.clone(),
            resumed: request.task.session_id.clone(),
            in_progress,
        });

        for (path, contents) in &script.writes {
            let target = request.workdir.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, contents)?;
        }
        let progress = Arc::new(SessionProgress::new());
        for line in &script.lines {
            progress.record_line(line);
        }
        if let Some(flag) = &script.interrupt {
            flag.raise();
        }
        Ok(Box::new(ScriptedRunning { progress, script }))
    }
}

struct ScriptedRunning {
    progress: Arc<SessionProgress>,
    script: ScriptedSession,
}

impl ScriptedRunning {
    fn report(&self, outcome: SessionOutcome) -> SessionReport {
        SessionReport {
            outcome,
            session_id: self.script.session_id.clone(),
            cost: self.script.cost_usd.map(|usd| SessionCost {
                usd,
                estimated: false,
            }),
            notes: self.progress.handover(),
        }
    }
}

impl Session for ScriptedRunning {
    fn progress(&self) -> Arc<SessionProgress> {
        Arc::clone(&self.progress)
    }

    fn try_finish(&mut self) -> Result<Option<SessionReport>> {
        match &self.script.end {
            ScriptedEnd::Finish(outcome) => Ok(Some(self.report(outcome.clone()))),
            ScriptedEnd::Hang => Ok(None),
            ScriptedEnd::Error(error) => Err(anyhow!("{error}")),
        }
    }

    fn cancel(&mut self) -> Result<SessionReport> {
        match &self.script.end {
            ScriptedEnd::Error(error) => Err(anyhow!("{error}")),
            _ => Ok(self.report(SessionOutcome::Cancelled)),
        }
    }
}

/// Validator that answers from a queue. `passing()` always passes.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    verdicts: Mutex<VecDeque<Verdict>>,
    always_pass: bool,
    calls: Mutex<usize>,
    /// Raised on every call, as if Ctrl+C arrived mid-validation.
    interrupt: Option<InterruptFlag>,
}

impl ScriptedValidator {
    pub fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            ..Self::default()
        }
    }

    pub fn passing() -> Self {
        Self {
            always_pass: true,
            ..Self::default()
        }
    }

    /// Raise `flag` while validating, then answer `verdict`.
    pub fn interrupting(flag: &InterruptFlag, verdict: Verdict) -> Self {
        Self {
            interrupt: Some(flag.clone()),
            ..Self::new(vec![verdict])
        }
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, _request: &ValidationRequest) -> Result<Verdict> {
        *lock(&self.calls) += 1;
        if let Some(flag) = &self.interrupt {
            flag.raise();
        }
        if self.always_pass {
            return Ok(Verdict::Pass);
        }
        lock(&self.verdicts)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted verdict left"))
    }
}

/// Stall analyzer that answers from a queue, then errors.
#[derive(Debug, Default)]
pub struct ScriptedAnalyzer {
    answers: Mutex<VecDeque<Analysis>>,
    calls: Mutex<usize>,
}

impl ScriptedAnalyzer {
    pub fn new(answers: Vec<Analysis>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> usize {
        *lock(&self.calls)
    }
}

impl StallAnalyzer for ScriptedAnalyzer {
    fn analyze(&self, _request: &AnalysisRequest<'_>) -> Result<Analysis> {
        *lock(&self.calls) += 1;
        lock(&self.answers)
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted analysis left"))
    }
}

/// Re-planner that answers from a queue, then falls back to [`RetryPolicy`].
/// Every call records the ids of the failed tasks it was shown.
#[derive(Debug, Default)]
pub struct ScriptedReplanner {
    responses: Mutex<VecDeque<Result<ReplanResponse>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedReplanner {
    pub fn new(responses: Vec<Result<ReplanResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::default(),
        }
    }

    pub fn retrying() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clone()
    }

    /// Number of calls whose failed set included `task_id`.
    pub fn calls_for(&self, task_id: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|ids| ids.iter().any(|id| id == task_id))
            .count()
    }
}

impl Replanner for ScriptedReplanner {
    fn replan(&self, request: &ReplanRequest<'_>) -> Result<ReplanResponse> {
        lock(&self.calls).push(request.failed.iter().map(|t| t.id.clone()).collect());
        match lock(&self.responses).pop_front() {
            Some(response) => response,
            None => RetryPolicy.replan(request),
        }
    }
}

/// Version control whose commits always fail; everything else is real git.
#[derive(Debug, Clone)]
pub struct FailingCommits {
    git: Git,
}

impl FailingCommits {
    pub fn new(git: Git) -> Self {
        Self { git }
    }
}

impl VersionControl for FailingCommits {
    fn snapshot(&self) -> Result<CommitRef> {
        self.git.snapshot()
    }

    fn commit(&self, _message: &str) -> Result<CommitRef> {
        Err(anyhow!("pre-commit hook rejected the change"))
    }

    fn rollback(&self, to: &CommitRef) -> Result<()> {
        self.git.rollback(to)
    }

    fn current_ref(&self) -> Result<CommitRef> {
        self.git.current_ref()
    }
}
