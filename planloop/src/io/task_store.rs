//! Durable task list: load with schema + invariant validation, atomic save,
//! and every mutation the engine performs.
//!
//! Each mutating method persists before returning, so the file on disk always
//! reflects the last transition.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::{debug, info};

use crate::core::error::EngineError;
use crate::core::invariants::validate_invariants;
use crate::core::ordering::{IdScheme, detect_scheme, sort_tasks, suggest_next_id};
use crate::core::replan::{ReplanDecision, ReplanSummary, apply_decisions};
use crate::core::selector;
use crate::core::transition::{ResetScope, TransitionFields, apply_transition, reset_task};
use crate::task::{Task, TaskStatus};

const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    scheme: IdScheme,
    tasks: Vec<Task>,
}

impl TaskStore {
    /// Store with no tasks; nothing is written until [`TaskStore::save`].
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            scheme: IdScheme::Hierarchical,
            tasks: Vec::new(),
        }
    }

    /// Build a store from in-memory tasks, checking invariants.
    pub fn from_tasks(path: impl Into<PathBuf>, mut tasks: Vec<Task>) -> Result<Self> {
        check_invariants(&tasks)?;
        let scheme = detect_scheme(&tasks).map_err(|err| anyhow!(err))?;
        sort_tasks(scheme, &mut tasks);
        Ok(Self {
            path: path.into(),
            scheme,
            tasks,
        })
    }

    /// Load and validate the task list (schema + invariants).
    ///
    /// Accepts a bare array or an object wrapping it under `"tasks"`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read tasks {}", path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse tasks {}", path.display()))?;
        let list = match value {
            Value::Object(mut map) => map
                .remove("tasks")
                .ok_or_else(|| anyhow!("{}: object form needs a \"tasks\" array", path.display()))?,
            other => other,
        };
        validate_schema(&list).with_context(|| format!("validate {}", path.display()))?;
        let tasks: Vec<Task> = serde_json::from_value(list)
            .with_context(|| format!("deserialize tasks {}", path.display()))?;
        Self::from_tasks(path, tasks).with_context(|| format!("load {}", path.display()))
    }

    /// Write the list atomically (temp file, fsync, rename).
    pub fn save(&self) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(&self.tasks).context("serialize tasks")?;
        buf.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp_path)
                .with_context(|| format!("create temp tasks {}", tmp_path.display()))?;
            file.write_all(buf.as_bytes())
                .with_context(|| format!("write temp tasks {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("sync temp tasks {}", tmp_path.display()))?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace tasks {}", self.path.display()))?;
        debug!(path = %self.path.display(), tasks = self.tasks.len(), "tasks saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scheme(&self) -> IdScheme {
        self.scheme
    }

    /// Tasks in execution order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn require(&self, id: &str) -> Result<&Task, EngineError> {
        self.get(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn next_eligible(&self) -> Option<&Task> {
        selector::next_eligible(&self.tasks, self.scheme)
    }

    pub fn in_progress(&self) -> Option<&Task> {
        selector::in_progress(&self.tasks)
    }

    pub fn failed(&self) -> Vec<&Task> {
        selector::failed(&self.tasks, self.scheme)
    }

    /// Direct children of `id` under the dotted-id convention.
    pub fn children(&self, id: &str) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.parent_id() == Some(id))
            .collect()
    }

    pub fn suggest_next_id(&self, parent_id: Option<&str>) -> String {
        suggest_next_id(&self.tasks, parent_id)
    }

    /// Apply one transition and persist. The in-memory list is unchanged on error.
    pub fn transition(&mut self, id: &str, to: TaskStatus, fields: TransitionFields) -> Result<()> {
        apply_transition(&mut self.tasks, id, to, fields)?;
        debug!(task_id = id, status = %to, "task transitioned");
        self.save()
    }

    /// Record handover notes written by a session.
    pub fn set_notes(&mut self, id: &str, notes: &str) -> Result<()> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        task.notes = Some(notes.trim().to_string());
        self.save()
    }

    /// Apply re-planning decisions, re-sort, re-validate, persist.
    pub fn apply_replan(
        &mut self,
        decisions: &[ReplanDecision],
        max_task_retries: u32,
    ) -> Result<ReplanSummary> {
        let mut next = self.tasks.clone();
        let summary = apply_decisions(&mut next, decisions, max_task_retries)?;
        check_invariants(&next).context("re-planned task list")?;
        sort_tasks(self.scheme, &mut next);
        self.tasks = next;
        self.save()?;
        Ok(summary)
    }

    /// Reset one task to `pending`. Idempotent.
    pub fn reset_one(&mut self, id: &str) -> Result<()> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        reset_task(task, ResetScope::Single);
        self.save()
    }

    /// Reset every task to a pristine `pending` state. Idempotent.
    pub fn reset_all(&mut self) -> Result<()> {
        for task in &mut self.tasks {
            reset_task(task, ResetScope::Full);
        }
        self.save()
    }

    /// Return a task left `in_progress` by a crashed run to `pending`,
    /// keeping its session id for resumption.
    pub fn recover_interrupted(&mut self) -> Result<Option<String>> {
        let Some(id) = self.in_progress().map(|t| t.id.clone()) else {
            return Ok(None);
        };
        info!(task_id = %id, "recovering task left in progress");
        self.transition(&id, TaskStatus::Pending, TransitionFields::default())?;
        Ok(Some(id))
    }

    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats {
            total: self.tasks.len(),
            ..TaskStats::default()
        };
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Indented, status-marked listing in execution order.
    pub fn tree_view(&self) -> String {
        let mut out = String::new();
        for task in &self.tasks {
            let indent = match self.scheme {
                IdScheme::Hierarchical => "  ".repeat(task.depth()),
                IdScheme::Priority => String::new(),
            };
            out.push_str(&format!(
                "{indent}{} {} {}",
                task.status.glyph(),
                task.id,
                task.description
            ));
            if task.retries > 0 {
                out.push_str(&format!(" (retries: {})", task.retries));
            }
            out.push('\n');
            if let Some(error) = &task.error_message {
                out.push_str(&format!("{indent}    error: {error}\n"));
            }
        }
        out
    }
}

fn check_invariants(tasks: &[Task]) -> Result<()> {
    let errors = validate_invariants(tasks);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("task invariants failed: {}", errors.join("; ")))
}

fn validate_schema(tasks: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(TASKS_SCHEMA).context("parse tasks schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(tasks) {
        let messages = compiled
            .iter_errors(tasks)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "task schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
