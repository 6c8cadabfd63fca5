//! One re-planning cycle: ask the re-planner about failed tasks, apply the
//! legal decisions, and record what happened.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::replan::ReplanSummary;
use crate::gate::record;
use crate::io::cost_ledger::{CostEntry, CostLedger, CostSource};
use crate::io::progress_log::{JournalEvent, ProgressLog};
use crate::io::replanner::{ReplanRequest, Replanner};
use crate::io::task_store::TaskStore;
use crate::task::Task;

/// Inputs that stay fixed for a whole run.
#[derive(Debug, Clone, Copy)]
pub struct ReplanEnv<'a> {
    pub workdir: &'a Path,
    pub scratch_dir: &'a Path,
    pub max_task_retries: u32,
}

/// Run cycle number `cycle` against the failed tasks in `store`.
///
/// A re-planner that errors or produces nothing usable counts as a cycle
/// with no decisions. Errors applying legal decisions are returned.
#[instrument(skip_all, fields(cycle = cycle))]
pub fn run_replan_cycle<P: Replanner>(
    store: &mut TaskStore,
    replanner: &P,
    ledger: &CostLedger,
    journal: &ProgressLog,
    env: &ReplanEnv<'_>,
    cycle: u32,
) -> Result<ReplanSummary> {
    let failed: Vec<Task> = store.failed().into_iter().cloned().collect();
    info!(failed = failed.len(), "re-planning");
    let request = ReplanRequest {
        workdir: env.workdir,
        failed: &failed,
        tasks: store.tasks(),
        max_task_retries: env.max_task_retries,
        cycle,
        scratch_dir: env.scratch_dir,
    };
    let response = match replanner.replan(&request) {
        Ok(response) => response,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "re-planner failed, no decisions this cycle");
            return Ok(ReplanSummary::default());
        }
    };
    if let Some(cost) = response.cost_usd {
        ledger.append(CostEntry {
            source: CostSource::Replanner,
            amount_usd: cost,
            task_id: None,
            estimated: false,
            details: format!("cycle {cycle}"),
        });
    }

    let summary = store
        .apply_replan(&response.decisions, env.max_task_retries)
        .context("apply re-planning decisions")?;
    for rejected in &summary.rejected {
        warn!(
            task_id = %rejected.task_id,
            action = rejected.action,
            reason = %rejected.reason,
            "rejected re-planning decision"
        );
    }
    journal_summary(journal, &failed, &summary);
    info!(
        applied = summary.applied(),
        rejected = summary.rejected.len(),
        "re-planning cycle done"
    );
    Ok(summary)
}

fn journal_summary(journal: &ProgressLog, failed: &[Task], summary: &ReplanSummary) {
    let description = |id: &str| {
        failed
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.description.clone())
            .unwrap_or_default()
    };
    let mut entries: Vec<(String, String)> = Vec::new();
    for id in &summary.retried {
        entries.push((id.clone(), "retry unchanged".to_string()));
    }
    for id in &summary.modified {
        entries.push((id.clone(), "retry with modified task".to_string()));
    }
    for (id, children) in &summary.split {
        entries.push((id.clone(), format!("split into {}", children.join(", "))));
    }
    for id in &summary.deleted {
        entries.push((id.clone(), "deleted from plan".to_string()));
    }
    for (id, details) in entries {
        record(
            journal,
            &id,
            &description(&id),
            JournalEvent::Replanned,
            None,
            &details,
        );
    }
}
