//! Stall analyzers: a second opinion before a suspected loop is cancelled.
//!
//! The monitor only asks when its heuristics see repeating tool calls. An
//! analyzer that fails, times out or answers something unreadable counts as
//! "continue"; the monitor asks again after another window of activity.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::monitor::StallReason;
use crate::io::config::MonitorSettings;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::render_analyze_prompt;

const ANALYSIS_OUTPUT_SCHEMA: &str = include_str!("../../schemas/analysis_output.schema.json");
const OUTPUT_LIMIT_BYTES: usize = 100_000;

#[derive(Debug, Clone)]
pub struct AnalysisRequest<'a> {
    pub workdir: &'a Path,
    pub task_id: &'a str,
    pub description: &'a str,
    pub elapsed: Duration,
    pub checks: u32,
    pub suspicion: &'a StallReason,
    pub recent_tools: &'a [String],
    pub transcript_tail: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Analysis {
    Continue {
        reason: String,
    },
    Intervene {
        reason: String,
        suggestion: Option<String>,
    },
}

/// Judges whether a suspected stall is real.
pub trait StallAnalyzer: Send + Sync + fmt::Debug {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<Analysis>;
}

/// Runs an external command with the analysis prompt on stdin and reads a
/// decision object from its stdout.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandAnalyzer {
    /// `None` when no analyzer command is configured.
    pub fn from_settings(settings: &MonitorSettings) -> Option<Self> {
        (!settings.analyzer_command.is_empty()).then(|| Self {
            command: settings.analyzer_command.clone(),
            timeout: settings.analyzer_timeout(),
        })
    }
}

impl StallAnalyzer for CommandAnalyzer {
    #[instrument(skip_all, fields(task_id = %request.task_id, checks = request.checks))]
    fn analyze(&self, request: &AnalysisRequest<'_>) -> Result<Analysis> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("analyzer command is empty"))?;
        let prompt = render_analyze_prompt(
            request.task_id,
            request.description,
            request.elapsed,
            request.checks,
            &request.suspicion.to_string(),
            request.recent_tools,
            request.transcript_tail,
        )?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(request.workdir);

        info!("invoking stall analyzer");
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            OUTPUT_LIMIT_BYTES,
        )
        .context("run stall analyzer")?;
        if output.timed_out {
            return Err(anyhow!(
                "stall analyzer timed out after {}s",
                self.timeout.map(|t| t.as_secs()).unwrap_or_default()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "stall analyzer failed with status {:?}",
                output.status.code()
            ));
        }
        parse_analysis(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisOutput {
    decision: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    suggestion: Option<String>,
}

/// Parse analyzer output: the decision object itself, an agent CLI JSON
/// envelope whose `result` text embeds it, or prose around one object.
/// Unknown decisions mean continue.
pub fn parse_analysis(raw: &str) -> Result<Analysis> {
    let value = decision_value(raw)?;
    let schema: Value =
        serde_json::from_str(ANALYSIS_OUTPUT_SCHEMA).context("parse analysis output schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(&value) {
        let messages = compiled
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        warn!(errors = messages.len(), "analyzer output failed schema validation");
        return Err(anyhow!(
            "analyzer output schema validation failed: {}",
            messages.join("; ")
        ));
    }
    let output: AnalysisOutput =
        serde_json::from_value(value).context("deserialize analyzer output")?;
    let reason = output.reason.unwrap_or_default();
    Ok(match output.decision.trim().to_lowercase().as_str() {
        "intervene" => Analysis::Intervene {
            reason,
            suggestion: output.suggestion.filter(|s| !s.trim().is_empty()),
        },
        "continue" => Analysis::Continue { reason },
        other => {
            debug!(decision = other, "unknown analyzer decision, continuing");
            Analysis::Continue { reason }
        }
    })
}

fn decision_value(raw: &str) -> Result<Value> {
    let text = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.get("decision").is_some() {
            return Ok(value);
        }
        if let Some(result) = value.get("result").and_then(Value::as_str) {
            return embedded_object(result);
        }
    }
    embedded_object(text)
}

fn embedded_object(text: &str) -> Result<Value> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow!("no JSON object in analyzer output"))?;
    let end = text
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| anyhow!("no JSON object in analyzer output"))?;
    serde_json::from_str(&text[start..=end]).context("parse analyzer output")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_and_enveloped_decisions() {
        assert_eq!(
            parse_analysis(r#"{"decision": "continue", "reason": "tests changing"}"#)
                .expect("bare"),
            Analysis::Continue {
                reason: "tests changing".to_string()
            }
        );

        let envelope = r#"{"type":"result","result":"Looks stuck.\n{\"decision\": \"INTERVENE\", \"reason\": \"same edit 8 times\", \"suggestion\": \"split the task\"}"}"#;
        assert_eq!(
            parse_analysis(envelope).expect("envelope"),
            Analysis::Intervene {
                reason: "same edit 8 times".to_string(),
                suggestion: Some("split the task".to_string())
            }
        );
    }

    #[test]
    fn unknown_decision_continues() {
        assert_eq!(
            parse_analysis(r#"{"decision": "wait", "reason": "training"}"#).expect("parse"),
            Analysis::Continue {
                reason: "training".to_string()
            }
        );
    }

    #[test]
    fn rejects_output_without_decision() {
        assert!(parse_analysis("no idea").is_err());
        assert!(parse_analysis(r#"{"reason": "missing"}"#).is_err());
    }

    #[test]
    fn from_settings_needs_a_command() {
        assert!(CommandAnalyzer::from_settings(&MonitorSettings::default()).is_none());
        let settings = MonitorSettings {
            analyzer_command: vec!["./analyze.sh".to_string()],
            ..MonitorSettings::default()
        };
        assert!(CommandAnalyzer::from_settings(&settings).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn command_analyzer_reads_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = MonitorSettings {
            analyzer_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > prompt.txt; echo '{"decision":"intervene","reason":"loop"}'"#.to_string(),
            ],
            ..MonitorSettings::default()
        };
        let analyzer = CommandAnalyzer::from_settings(&settings).expect("configured");
        let suspicion = StallReason::Looping {
            window: 10,
            unique: 1,
        };
        let tools = vec!["Bash {}".to_string()];
        let request = AnalysisRequest {
            workdir: temp.path(),
            task_id: "3",
            description: "add parser",
            elapsed: Duration::from_secs(90),
            checks: 4,
            suspicion: &suspicion,
            recent_tools: &tools,
            transcript_tail: "retrying",
        };

        let analysis = analyzer.analyze(&request).expect("analyze");

        assert_eq!(
            analysis,
            Analysis::Intervene {
                reason: "loop".to_string(),
                suggestion: None
            }
        );
        let prompt = std::fs::read_to_string(temp.path().join("prompt.txt")).expect("prompt");
        assert!(prompt.contains("add parser"));
    }
}
