//! `planloop reset`: return tasks to `pending` for manual recovery.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::io::init::PlanPaths;
use crate::io::progress_log::ProgressLog;
use crate::io::task_store::TaskStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetTarget {
    /// Clear error and session, keep the retry count.
    Task(String),
    /// Pristine list: every task pending with no history, journal cleared.
    All,
}

pub fn reset(root: &Path, target: &ResetTarget) -> Result<()> {
    let paths = PlanPaths::new(root);
    let mut store = TaskStore::load(&paths.tasks_path)
        .with_context(|| format!("load tasks {}", paths.tasks_path.display()))?;
    match target {
        ResetTarget::Task(id) => {
            store.reset_one(id)?;
            info!(task_id = %id, "task reset");
        }
        ResetTarget::All => {
            store.reset_all()?;
            ProgressLog::new(&paths.progress_path).clear()?;
            info!(tasks = store.tasks().len(), "all tasks reset");
        }
    }
    Ok(())
}
