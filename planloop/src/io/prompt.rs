//! Prompt rendering for agent sessions, the external re-planner and the
//! stall analyzer.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::task::Task;

const SESSION_TEMPLATE: &str = include_str!("prompts/session.md");
const REPLAN_TEMPLATE: &str = include_str!("prompts/replan.md");
const ANALYZE_TEMPLATE: &str = include_str!("prompts/analyze.md");

/// Task fields exposed to templates.
#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    id: &'a str,
    description: &'a str,
    steps: &'a [String],
    status: &'a str,
    notes: Option<&'a str>,
    error_message: Option<&'a str>,
    retries: u32,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a Task) -> Self {
        Self {
            id: &task.id,
            description: &task.description,
            steps: &task.steps,
            status: task.status.as_str(),
            notes: non_empty(task.notes.as_deref()),
            error_message: non_empty(task.error_message.as_deref()),
            retries: task.retries,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("session", SESSION_TEMPLATE)
            .context("load session template")?;
        env.add_template("replan", REPLAN_TEMPLATE)
            .context("load replan template")?;
        env.add_template("analyze", ANALYZE_TEMPLATE)
            .context("load analyze template")?;
        Ok(Self { env })
    }
}

/// Render the prompt handed to an agent session on stdin.
pub fn render_session_prompt(
    task: &Task,
    recent_progress: Option<&str>,
    workdir: &Path,
) -> Result<String> {
    let engine = PromptEngine::new()?;
    let template = engine.env.get_template("session")?;
    let rendered = template
        .render(context! {
            task => TaskContext::from_task(task),
            recent_progress => non_empty(recent_progress),
            workdir => workdir.display().to_string(),
        })
        .context("render session prompt")?;
    Ok(rendered)
}

/// Render the prompt handed to an external re-planner.
pub fn render_replan_prompt(
    failed: &[Task],
    tasks: &[Task],
    max_task_retries: u32,
    output_path: &Path,
) -> Result<String> {
    let engine = PromptEngine::new()?;
    let template = engine.env.get_template("replan")?;
    let failed: Vec<TaskContext<'_>> = failed.iter().map(TaskContext::from_task).collect();
    let tasks: Vec<TaskContext<'_>> = tasks.iter().map(TaskContext::from_task).collect();
    let rendered = template
        .render(context! {
            failed => failed,
            tasks => tasks,
            max_task_retries => max_task_retries,
            output_path => output_path.display().to_string(),
        })
        .context("render replan prompt")?;
    Ok(rendered)
}

/// Render the prompt handed to the stall analyzer.
pub fn render_analyze_prompt(
    task_id: &str,
    description: &str,
    elapsed: Duration,
    checks: u32,
    suspicion: &str,
    recent_tools: &[String],
    transcript: &str,
) -> Result<String> {
    let engine = PromptEngine::new()?;
    let template = engine.env.get_template("analyze")?;
    let rendered = template
        .render(context! {
            task_id => task_id,
            description => description,
            elapsed => format_elapsed(elapsed),
            checks => checks,
            suspicion => suspicion,
            recent_tools => recent_tools,
            transcript => transcript.trim(),
        })
        .context("render analyze prompt")?;
    Ok(rendered)
}

/// `HH:MM:SS`.
fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, secs % 3600 / 60, secs % 60)
}
