//! Engine configuration stored under `.planloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::monitor::StallPolicy;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlanConfig {
    /// Re-planner retries allowed per task before it is left failed.
    pub max_task_retries: u32,

    /// Consecutive re-plan cycles without a completed task before the run halts.
    pub max_replan_cycles: u32,

    /// Number of recent progress journal entries shown to each session.
    pub progress_entries: usize,

    pub monitor: MonitorSettings,
    pub session: SessionSettings,
    pub validate: ValidateSettings,
    pub replanner: ReplannerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitorSettings {
    pub check_interval_secs: u64,
    pub stall_after_idle_checks: u32,
    pub loop_window: usize,
    pub loop_max_unique: usize,
    /// Consulted before a suspected loop is cancelled. Empty cancels loops
    /// without asking.
    pub analyzer_command: Vec<String>,
    /// `0` disables the timeout.
    pub analyzer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionSettings {
    /// Agent command; the rendered prompt is written to its stdin.
    pub command: Vec<String>,
    /// Appended when resuming a prior session. `{session_id}` is substituted.
    pub resume_args: Vec<String>,
    pub output_limit_bytes: usize,
    /// Time between the interrupt signal and a hard kill on cancel.
    pub cancel_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidateSettings {
    /// Project validation command (e.g. `["just","ci"]`).
    pub command: Vec<String>,
    /// `0` disables the timeout.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReplannerSettings {
    /// External re-planner command. Empty selects the built-in retry policy.
    /// `{output}` is replaced by the path the decisions file must be written to.
    pub command: Vec<String>,
    /// `0` disables the timeout.
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            max_task_retries: 3,
            max_replan_cycles: 3,
            progress_entries: 3,
            monitor: MonitorSettings::default(),
            session: SessionSettings::default(),
            validate: ValidateSettings::default(),
            replanner: ReplannerSettings::default(),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        let policy = StallPolicy::default();
        Self {
            check_interval_secs: 300,
            stall_after_idle_checks: policy.stall_after_idle_checks,
            loop_window: policy.loop_window,
            loop_max_unique: policy.loop_max_unique,
            analyzer_command: Vec::new(),
            analyzer_timeout_secs: 60,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            command: [
                "claude",
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            resume_args: vec!["--resume".to_string(), "{session_id}".to_string()],
            output_limit_bytes: 1_000_000,
            cancel_grace_secs: 5,
        }
    }
}

impl Default for ValidateSettings {
    fn default() -> Self {
        Self {
            command: vec!["just".to_string(), "ci".to_string()],
            timeout_secs: 0,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for ReplannerSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl MonitorSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stall_policy(&self) -> StallPolicy {
        StallPolicy {
            stall_after_idle_checks: self.stall_after_idle_checks,
            loop_window: self.loop_window,
            loop_max_unique: self.loop_max_unique,
        }
    }

    pub fn analyzer_timeout(&self) -> Option<Duration> {
        optional_secs(self.analyzer_timeout_secs)
    }
}

impl ValidateSettings {
    pub fn timeout(&self) -> Option<Duration> {
        optional_secs(self.timeout_secs)
    }
}

impl ReplannerSettings {
    pub fn timeout(&self) -> Option<Duration> {
        optional_secs(self.timeout_secs)
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl PlanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_replan_cycles == 0 {
            return Err(anyhow!("max_replan_cycles must be > 0"));
        }
        if self.monitor.check_interval_secs == 0 {
            return Err(anyhow!("monitor.check_interval_secs must be > 0"));
        }
        if self.monitor.stall_after_idle_checks == 0 {
            return Err(anyhow!("monitor.stall_after_idle_checks must be > 0"));
        }
        if self.monitor.loop_max_unique >= self.monitor.loop_window && self.monitor.loop_window > 0
        {
            return Err(anyhow!(
                "monitor.loop_max_unique must be smaller than monitor.loop_window"
            ));
        }
        check_command("session.command", &self.session.command)?;
        check_command("validate.command", &self.validate.command)?;
        if !self.replanner.command.is_empty() {
            check_command("replanner.command", &self.replanner.command)?;
        }
        if !self.monitor.analyzer_command.is_empty() {
            check_command("monitor.analyzer_command", &self.monitor.analyzer_command)?;
        }
        if self.session.output_limit_bytes == 0
            || self.validate.output_limit_bytes == 0
            || self.replanner.output_limit_bytes == 0
        {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

fn check_command(field: &str, command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{field} must be a non-empty array")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PlanConfig::default()`.
pub fn load_config(path: &Path) -> Result<PlanConfig> {
    if !path.exists() {
        let cfg = PlanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PlanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PlanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
