//! Re-planner adapters.
//!
//! A re-planner looks at the failed tasks and proposes decisions. The engine
//! checks every decision for legality before applying it, so adapters only
//! have to produce well-formed JSON.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::replan::ReplanDecision;
use crate::core::selector::at_retry_ceiling;
use crate::io::config::ReplannerSettings;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::render_replan_prompt;
use crate::task::Task;

const REPLAN_OUTPUT_SCHEMA: &str = include_str!("../../schemas/replan_output.schema.json");

#[derive(Debug, Clone)]
pub struct ReplanRequest<'a> {
    pub workdir: &'a Path,
    /// Failed tasks, in execution order.
    pub failed: &'a [Task],
    /// The whole list, for context.
    pub tasks: &'a [Task],
    pub max_task_retries: u32,
    /// 1-based cycle number within this run.
    pub cycle: u32,
    /// Directory for prompts, outputs and logs of this invocation.
    pub scratch_dir: &'a Path,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReplanResponse {
    pub decisions: Vec<ReplanDecision>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

pub trait Replanner {
    fn replan(&self, request: &ReplanRequest<'_>) -> Result<ReplanResponse>;
}

/// Built-in policy: retry every failed task that still has budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl Replanner for RetryPolicy {
    fn replan(&self, request: &ReplanRequest<'_>) -> Result<ReplanResponse> {
        let decisions = request
            .failed
            .iter()
            .filter(|task| !at_retry_ceiling(task, request.max_task_retries))
            .map(|task| ReplanDecision::retry(task.id.clone()))
            .collect();
        Ok(ReplanResponse {
            decisions,
            cost_usd: None,
        })
    }
}

/// Runs an external command with the re-planning prompt on stdin.
///
/// The literal `{output}` in any argument is replaced with the path the
/// command should write its JSON to. Without an output file, stdout is
/// parsed instead.
#[derive(Debug, Clone)]
pub struct CommandReplanner {
    command: Vec<String>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
}

impl CommandReplanner {
    pub fn new(settings: &ReplannerSettings) -> Self {
        Self {
            command: settings.command.clone(),
            timeout: settings.timeout(),
            output_limit_bytes: settings.output_limit_bytes,
        }
    }
}

impl Replanner for CommandReplanner {
    #[instrument(skip_all, fields(cycle = request.cycle, failed = request.failed.len()))]
    fn replan(&self, request: &ReplanRequest<'_>) -> Result<ReplanResponse> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("replanner command is empty"))?;
        fs::create_dir_all(request.scratch_dir).with_context(|| {
            format!("create replan dir {}", request.scratch_dir.display())
        })?;
        let output_path = request
            .scratch_dir
            .join(format!("cycle-{}.json", request.cycle));
        let log_path = request
            .scratch_dir
            .join(format!("cycle-{}.log", request.cycle));
        if output_path.exists() {
            fs::remove_file(&output_path)
                .with_context(|| format!("remove stale {}", output_path.display()))?;
        }

        let prompt = render_replan_prompt(
            request.failed,
            request.tasks,
            request.max_task_retries,
            &output_path,
        )?;
        let output_arg = output_path.display().to_string();
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|arg| arg.replace("{output}", &output_arg)))
            .current_dir(request.workdir);

        info!("invoking re-planner");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .context("run replanner")?;
        fs::write(&log_path, output.render_log("replanner"))
            .with_context(|| format!("write replanner log {}", log_path.display()))?;

        if output.timed_out {
            return Err(anyhow!(
                "replanner timed out after {}s",
                self.timeout.map(|t| t.as_secs()).unwrap_or_default()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "replanner failed with status {:?}",
                output.status.code()
            ));
        }

        let raw = if output_path.exists() {
            fs::read_to_string(&output_path)
                .with_context(|| format!("read replanner output {}", output_path.display()))?
        } else {
            debug!("no output file, parsing stdout");
            String::from_utf8_lossy(&output.stdout).into_owned()
        };
        parse_response(&raw)
    }
}

/// Re-planner selected by configuration.
#[derive(Debug, Clone)]
pub enum ReplannerBackend {
    Retry(RetryPolicy),
    Command(CommandReplanner),
}

impl ReplannerBackend {
    /// An empty command selects the built-in retry policy.
    pub fn from_settings(settings: &ReplannerSettings) -> Self {
        if settings.command.is_empty() {
            ReplannerBackend::Retry(RetryPolicy)
        } else {
            ReplannerBackend::Command(CommandReplanner::new(settings))
        }
    }
}

impl Replanner for ReplannerBackend {
    fn replan(&self, request: &ReplanRequest<'_>) -> Result<ReplanResponse> {
        match self {
            ReplannerBackend::Retry(policy) => policy.replan(request),
            ReplannerBackend::Command(command) => command.replan(request),
        }
    }
}

/// Parse and schema-check re-planner output.
pub fn parse_response(raw: &str) -> Result<ReplanResponse> {
    let value: Value = serde_json::from_str(raw.trim()).context("parse replanner output")?;
    let schema: Value =
        serde_json::from_str(REPLAN_OUTPUT_SCHEMA).context("parse replan output schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(&value) {
        let messages = compiled
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        warn!(errors = messages.len(), "replanner output failed schema validation");
        return Err(anyhow!(
            "replanner output schema validation failed: {}",
            messages.join("; ")
        ));
    }
    serde_json::from_value(value).context("deserialize replanner output")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::replan::ReplanAction;
    use crate::test_support::{failed_task, task};

    fn request<'a>(
        dir: &'a Path,
        failed: &'a [Task],
        tasks: &'a [Task],
    ) -> ReplanRequest<'a> {
        ReplanRequest {
            workdir: dir,
            failed,
            tasks,
            max_task_retries: 3,
            cycle: 1,
            scratch_dir: dir,
        }
    }

    #[test]
    fn retry_policy_skips_tasks_at_ceiling() {
        let temp = tempfile::tempdir().expect("tempdir");
        let failed = vec![failed_task("1", "boom", 0), failed_task("2", "boom", 3)];
        let response = RetryPolicy
            .replan(&request(temp.path(), &failed, &failed))
            .expect("replan");
        assert_eq!(response.decisions, vec![ReplanDecision::retry("1")]);
    }

    #[test]
    fn parses_every_action() {
        let raw = r#"{
            "decisions": [
                {"task_id": "1", "action": "retry"},
                {"task_id": "2", "action": "modify", "description": "smaller scope"},
                {"task_id": "3", "action": "split", "subtasks": [{"description": "part a"}]},
                {"task_id": "4", "action": "delete", "reason": "obsolete"}
            ],
            "cost_usd": 0.12
        }"#;
        let response = parse_response(raw).expect("parse");
        assert_eq!(response.cost_usd, Some(0.12));
        let names: Vec<&str> = response.decisions.iter().map(|d| d.action.name()).collect();
        assert_eq!(names, vec!["retry", "modify", "split", "delete"]);
        match &response.decisions[2].action {
            ReplanAction::Split { subtasks } => assert_eq!(subtasks[0].description, "part a"),
            other => panic!("expected split, got {other:?}"),
        }
    }

    #[test]
    fn rejects_output_outside_schema() {
        let err = parse_response(r#"{"decisions": [{"task_id": "1", "action": "explode"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn empty_command_selects_retry_policy() {
        let backend = ReplannerBackend::from_settings(&ReplannerSettings::default());
        assert!(matches!(backend, ReplannerBackend::Retry(_)));
    }

    /// Verifies the command writes to the substituted output path and the
    /// prompt reaches it on stdin.
    #[cfg(unix)]
    #[test]
    fn command_replanner_reads_output_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = ReplannerSettings {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"grep -q 'Task 2' && printf '{"decisions":[{"task_id":"2","action":"retry"}]}' > "$1""#
                    .to_string(),
                "replanner".to_string(),
                "{output}".to_string(),
            ],
            ..ReplannerSettings::default()
        };
        let failed = vec![failed_task("2", "validation failed: lint", 0)];
        let tasks = vec![task("1"), failed[0].clone()];

        let response = CommandReplanner::new(&settings)
            .replan(&request(temp.path(), &failed, &tasks))
            .expect("replan");

        assert_eq!(response.decisions, vec![ReplanDecision::retry("2")]);
        assert!(temp.path().join("cycle-1.log").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn command_replanner_falls_back_to_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = ReplannerSettings {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"decisions":[{"task_id":"2","action":"delete"}]}'"#
                    .to_string(),
            ],
            ..ReplannerSettings::default()
        };
        let failed = vec![failed_task("2", "boom", 0)];

        let response = CommandReplanner::new(&settings)
            .replan(&request(temp.path(), &failed, &failed))
            .expect("replan");

        assert_eq!(response.decisions[0].action.name(), "delete");
    }
}
