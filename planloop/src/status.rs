//! Read-only reports: `planloop status`, `planloop cost`, `planloop log`, and
//! the halt report printed when a run stops with failed tasks.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::io::cost_ledger::{CostSummary, load_history, summarize};
use crate::io::init::PlanPaths;
use crate::io::task_store::{TaskStats, TaskStore};
use crate::task::Task;

/// A failed task as shown in reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTask {
    pub id: String,
    pub description: String,
    pub error_message: String,
    pub retries: u32,
}

impl FailedTask {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            error_message: task.error_message.clone().unwrap_or_default(),
            retries: task.retries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub stats: TaskStats,
    pub tree: String,
    pub next: Option<String>,
    pub failed: Vec<FailedTask>,
    pub cost: CostSummary,
}

pub fn status_report(root: &Path) -> Result<StatusReport> {
    let paths = PlanPaths::new(root);
    let store = TaskStore::load(&paths.tasks_path)
        .with_context(|| format!("load tasks (run `planloop init` in {})", root.display()))?;
    let history = load_history(&paths.cost_history_path)?;
    Ok(StatusReport {
        stats: store.stats(),
        tree: store.tree_view(),
        next: store.next_eligible().map(|t| t.id.clone()),
        failed: store.failed().into_iter().map(FailedTask::from_task).collect(),
        cost: summarize(&history),
    })
}

pub fn render_status(report: &StatusReport) -> String {
    let stats = report.stats;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "tasks: {} total, {} completed, {} pending, {} in progress, {} failed",
        stats.total, stats.completed, stats.pending, stats.in_progress, stats.failed
    );
    if stats.total > 0 {
        out.push('\n');
        out.push_str(&report.tree);
    }
    match &report.next {
        Some(id) => {
            let _ = writeln!(out, "\nnext: {id}");
        }
        None if stats.failed == 0 && stats.total > 0 => out.push_str("\nall tasks completed\n"),
        None => {}
    }
    if report.cost.records > 0 {
        let _ = writeln!(out, "cost: ${:.2}", report.cost.total_usd);
    }
    out
}

/// Report printed when a run halts; names every failed task and its last error.
pub fn render_halt(reason: &str, failed: &[FailedTask]) -> String {
    let mut out = format!("run halted: {reason}\n");
    for task in failed {
        let _ = writeln!(
            out,
            "\n[!] {}: {} (retries: {})",
            task.id, task.description, task.retries
        );
        for line in task.error_message.lines() {
            let _ = writeln!(out, "    {line}");
        }
    }
    out.push_str("\nfix the tasks above, then `planloop reset <id>` and run again\n");
    out
}

pub fn render_cost(summary: &CostSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "total: ${:.4}", summary.total_usd);
    for (source, amount) in &summary.by_source {
        let _ = writeln!(out, "  {}: ${:.4}", source.as_str(), amount);
    }
    if summary.estimated_usd > 0.0 {
        let _ = writeln!(
            out,
            "estimated from token counts: ${:.4}",
            summary.estimated_usd
        );
    }
    let _ = writeln!(out, "records: {}", summary.records);
    out
}

/// Summary of the persisted cost history.
pub fn cost_report(root: &Path) -> Result<CostSummary> {
    let paths = PlanPaths::new(root);
    Ok(summarize(&load_history(&paths.cost_history_path)?))
}

/// Logs under a task's session directory, in the order a run writes them.
const TASK_LOG_FILES: [&str; 3] = ["stream.jsonl", "session.log", "validation.log"];

/// The last `lines` lines of every log the task's sessions left behind.
pub fn task_log(root: &Path, task_id: &str, lines: usize) -> Result<String> {
    let dir = PlanPaths::new(root).task_dir(task_id);
    let mut out = String::new();
    for name in TASK_LOG_FILES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let contents = String::from_utf8_lossy(&bytes);
        let all: Vec<&str> = contents.lines().collect();
        let shown = &all[all.len().saturating_sub(lines)..];
        let _ = writeln!(
            out,
            "==> {} (last {} of {} lines) <==",
            path.display(),
            shown.len(),
            all.len()
        );
        for line in shown {
            let _ = writeln!(out, "{line}");
        }
        out.push('\n');
    }
    if out.is_empty() {
        bail!("no logs for task {task_id} in {}", dir.display());
    }
    Ok(out)
}
