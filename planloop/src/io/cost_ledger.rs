//! Append-only cost ledger shared by the control loop and the re-planner.
//!
//! Records are kept in memory for the run summary and mirrored to
//! `.planloop/cost_history.jsonl` so `planloop cost` can total past runs.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// USD per million input tokens used when a session reports no cost.
pub const ESTIMATE_INPUT_USD_PER_MTOK: f64 = 3.0;
/// USD per million output tokens used when a session reports no cost.
pub const ESTIMATE_OUTPUT_USD_PER_MTOK: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    Session,
    Replanner,
}

impl CostSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CostSource::Session => "session",
            CostSource::Replanner => "replanner",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub timestamp: DateTime<Utc>,
    pub source: CostSource,
    pub amount_usd: f64,
    #[serde(default)]
    pub task_id: Option<String>,
    /// True when derived from token counts instead of a reported price.
    #[serde(default)]
    pub estimated: bool,
    #[serde(default)]
    pub details: String,
}

/// Input for [`CostLedger::append`].
#[derive(Debug, Clone)]
pub struct CostEntry {
    pub source: CostSource,
    pub amount_usd: f64,
    pub task_id: Option<String>,
    pub estimated: bool,
    pub details: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostSummary {
    pub total_usd: f64,
    pub estimated_usd: f64,
    pub by_source: BTreeMap<CostSource, f64>,
    pub records: usize,
}

/// Cloneable handle; all clones share one record list.
#[derive(Debug, Clone, Default)]
pub struct CostLedger {
    records: Arc<Mutex<Vec<CostRecord>>>,
    history_path: Option<PathBuf>,
}

impl CostLedger {
    /// Ledger that mirrors every record to `history_path`.
    pub fn new(history_path: impl Into<PathBuf>) -> Self {
        Self {
            records: Arc::default(),
            history_path: Some(history_path.into()),
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Record a cost. Non-positive and non-finite amounts are ignored.
    pub fn append(&self, entry: CostEntry) {
        if !entry.amount_usd.is_finite() || entry.amount_usd <= 0.0 {
            debug!(source = entry.source.as_str(), "ignoring empty cost entry");
            return;
        }
        let record = CostRecord {
            timestamp: Utc::now(),
            source: entry.source,
            amount_usd: entry.amount_usd,
            task_id: entry.task_id,
            estimated: entry.estimated,
            details: entry.details,
        };
        let mut records = self.lock();
        if let Some(path) = &self.history_path
            && let Err(err) = append_history(path, &record)
        {
            warn!(err = %format!("{err:#}"), "failed to append cost history");
        }
        records.push(record);
    }

    pub fn records(&self) -> Vec<CostRecord> {
        self.lock().clone()
    }

    pub fn summary(&self) -> CostSummary {
        summarize(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CostRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn summarize(records: &[CostRecord]) -> CostSummary {
    let mut summary = CostSummary {
        records: records.len(),
        ..CostSummary::default()
    };
    for record in records {
        summary.total_usd += record.amount_usd;
        if record.estimated {
            summary.estimated_usd += record.amount_usd;
        }
        *summary.by_source.entry(record.source).or_insert(0.0) += record.amount_usd;
    }
    summary
}

/// Price a session from token counts at the fixed estimate rates.
pub fn estimate_cost_usd(input_tokens: u64, output_tokens: u64) -> f64 {
    (input_tokens as f64 * ESTIMATE_INPUT_USD_PER_MTOK
        + output_tokens as f64 * ESTIMATE_OUTPUT_USD_PER_MTOK)
        / 1_000_000.0
}

/// Read every record from a history file. Malformed lines are skipped.
pub fn load_history(path: &Path) -> Result<Vec<CostRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut records = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CostRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(line = index + 1, err = %err, "skipping malformed cost record"),
        }
    }
    Ok(records)
}

fn append_history(path: &Path, record: &CostRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize cost record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}
