//! Session runner abstraction for agent invocation.
//!
//! The [`SessionRunner`] trait decouples the control loop from the agent
//! backend. A started [`Session`] is polled, not awaited: the loop keeps
//! checking the interrupt flag and the monitor between polls. Tests use
//! scripted runners that never spawn processes.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::monitor::ProgressProbe;
use crate::core::types::SessionOutcome;
use crate::io::config::SessionSettings;
use crate::io::cost_ledger::estimate_cost_usd;
use crate::io::process::{StreamingChild, spawn_streaming};
use crate::io::prompt::render_session_prompt;
use crate::task::Task;

/// Tool calls remembered for loop detection.
const RECENT_TOOLS_LIMIT: usize = 32;
/// Longest failure reason copied from session output.
const REASON_LIMIT: usize = 500;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(TASK_COMPLETED)|TASK_(BLOCKED|ERROR):[ \t]*(.*)$").unwrap()
});

/// Parameters for starting a session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub workdir: PathBuf,
    pub task: Task,
    /// Recent progress journal entries.
    pub recent_progress: Option<String>,
    /// Directory for stream and stderr logs of this session.
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionCost {
    pub usd: f64,
    pub estimated: bool,
}

/// Final report of a session, natural or cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub session_id: Option<String>,
    pub cost: Option<SessionCost>,
    /// Handover notes for whoever continues the task.
    pub notes: Option<String>,
}

/// Abstraction over agent session backends.
pub trait SessionRunner {
    fn start(&self, request: &SessionRequest) -> Result<Box<dyn Session>>;
}

/// A running session.
pub trait Session {
    /// Shared activity counters sampled by the monitor thread.
    fn progress(&self) -> Arc<SessionProgress>;
    /// `Some` once the session has ended on its own.
    fn try_finish(&mut self) -> Result<Option<SessionReport>>;
    /// Stop the session. The report always has outcome `Cancelled`.
    fn cancel(&mut self) -> Result<SessionReport>;
}

/// Completion markers a session prints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    Completed,
    Blocked(String),
    Error(String),
}

/// Last marker in `text`, if any.
pub fn detect_marker(text: &str) -> Option<Marker> {
    MARKER_RE.captures_iter(text).last().map(|caps| {
        if caps.get(1).is_some() {
            return Marker::Completed;
        }
        let reason = caps
            .get(3)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        match caps.get(2).map(|m| m.as_str()) {
            Some("BLOCKED") => Marker::Blocked(reason),
            _ => Marker::Error(reason),
        }
    })
}

/// Text between `HANDOVER_START` and `HANDOVER_END`, fences stripped.
pub fn extract_handover(text: &str) -> Option<String> {
    let start = text.rfind("HANDOVER_START")? + "HANDOVER_START".len();
    let end = start + text[start..].find("HANDOVER_END")?;
    let body = text[start..end].trim().trim_matches('`').trim();
    (!body.is_empty()).then(|| body.to_string())
}

/// One parsed line of a `stream-json` session transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Init {
        session_id: String,
    },
    Text(String),
    Tool(String),
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    Result {
        text: String,
        is_error: bool,
        cost_usd: Option<f64>,
        session_id: Option<String>,
    },
    /// Non-JSON output, kept so plain-text agents still count as active.
    Raw(String),
    /// JSON event with nothing the engine uses.
    Other,
}

/// Parse one stdout line into zero or more events.
pub fn parse_stream_line(line: &str) -> Vec<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return vec![StreamEvent::Raw(trimmed.to_string())];
    };
    let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(str::to_string);

    match value.get("type").and_then(Value::as_str) {
        Some("system") if value.get("subtype").and_then(Value::as_str) == Some("init") => {
            match str_field(&value, "session_id") {
                Some(session_id) => vec![StreamEvent::Init { session_id }],
                None => vec![StreamEvent::Other],
            }
        }
        Some("assistant") => {
            let message = value.get("message");
            let mut events = Vec::new();
            let blocks = message
                .and_then(|m| m.get("content"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for block in &blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = str_field(block, "text") {
                            events.push(StreamEvent::Text(text));
                        }
                    }
                    Some("tool_use") => {
                        let name = str_field(block, "name").unwrap_or_default();
                        let input = block.get("input").map(Value::to_string).unwrap_or_default();
                        events.push(StreamEvent::Tool(format!("{name} {input}")));
                    }
                    _ => {}
                }
            }
            if let Some(usage) = message.and_then(|m| m.get("usage")) {
                let count = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
                events.push(StreamEvent::Usage {
                    input_tokens: count("input_tokens"),
                    output_tokens: count("output_tokens"),
                });
            }
            if events.is_empty() {
                events.push(StreamEvent::Other);
            }
            events
        }
        Some("result") => vec![StreamEvent::Result {
            text: str_field(&value, "result").unwrap_or_default(),
            is_error: value
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
            session_id: str_field(&value, "session_id"),
        }],
        _ => vec![StreamEvent::Other],
    }
}

#[derive(Debug, Clone, Default)]
struct ProgressState {
    events: u64,
    recent_tools: VecDeque<String>,
    blocked: Option<String>,
    last_marker: Option<Marker>,
    session_id: Option<String>,
    result: Option<ResultSummary>,
    input_tokens: u64,
    output_tokens: u64,
    transcript_tail: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ResultSummary {
    text: String,
    is_error: bool,
    cost_usd: Option<f64>,
}

/// Activity counters shared between a session and the monitor thread.
#[derive(Debug, Default)]
pub struct SessionProgress {
    state: Mutex<ProgressState>,
}

impl SessionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_line(&self, line: &str) {
        for event in parse_stream_line(line) {
            self.record(&event);
        }
    }

    pub fn record(&self, event: &StreamEvent) {
        let mut state = self.lock();
        state.events += 1;
        match event {
            StreamEvent::Init { session_id } => state.session_id = Some(session_id.clone()),
            StreamEvent::Text(text) | StreamEvent::Raw(text) => {
                // Only the latest text decides whether the session is blocked.
                let marker = detect_marker(text);
                state.blocked = match &marker {
                    Some(Marker::Blocked(reason)) => Some(reason.clone()),
                    Some(Marker::Error(reason)) => Some(format!("error: {reason}")),
                    Some(Marker::Completed) | None => None,
                };
                if marker.is_some() {
                    state.last_marker = marker;
                }
                push_tail(&mut state.transcript_tail, text);
            }
            StreamEvent::Tool(signature) => {
                state.blocked = None;
                if state.recent_tools.len() == RECENT_TOOLS_LIMIT {
                    state.recent_tools.pop_front();
                }
                state.recent_tools.push_back(signature.clone());
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                state.input_tokens += input_tokens;
                state.output_tokens += output_tokens;
            }
            StreamEvent::Result {
                text,
                is_error,
                cost_usd,
                session_id,
            } => {
                if let Some(session_id) = session_id {
                    state.session_id = Some(session_id.clone());
                }
                if let Some(marker) = detect_marker(text) {
                    state.last_marker = Some(marker);
                }
                push_tail(&mut state.transcript_tail, text);
                state.result = Some(ResultSummary {
                    text: text.clone(),
                    is_error: *is_error,
                    cost_usd: *cost_usd,
                });
            }
            StreamEvent::Other => {}
        }
    }

    pub fn probe(&self) -> ProgressProbe {
        let state = self.lock();
        ProgressProbe {
            event_count: state.events,
            recent_tools: state.recent_tools.iter().cloned().collect(),
            blocked: state.blocked.clone(),
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().session_id.clone()
    }

    /// Reported cost if the session produced a result, else a token estimate.
    pub fn cost(&self) -> Option<SessionCost> {
        let state = self.lock();
        if let Some(usd) = state.result.as_ref().and_then(|r| r.cost_usd) {
            return Some(SessionCost {
                usd,
                estimated: false,
            });
        }
        let usd = estimate_cost_usd(state.input_tokens, state.output_tokens);
        (usd > 0.0).then_some(SessionCost {
            usd,
            estimated: true,
        })
    }

    /// Classify how a session that exited with `status` ended.
    pub fn outcome(&self, status: ExitStatus) -> SessionOutcome {
        let state = self.lock();
        if let Some(result) = &state.result
            && result.is_error
        {
            return SessionOutcome::Failure(reason_or(&result.text, "session reported an error"));
        }
        match &state.last_marker {
            Some(Marker::Blocked(reason)) => {
                return SessionOutcome::Failure(format!("blocked: {}", reason_or(reason, "no reason given")));
            }
            Some(Marker::Error(reason)) => {
                return SessionOutcome::Failure(format!("error: {}", reason_or(reason, "no reason given")));
            }
            _ => {}
        }
        if status.success() {
            SessionOutcome::Success
        } else {
            SessionOutcome::Failure(match status.code() {
                Some(code) => format!("session exited with status {code}"),
                None => "session terminated by signal".to_string(),
            })
        }
    }

    /// The last `limit` bytes (or fewer) of assistant text.
    pub fn recent_transcript(&self, limit: usize) -> String {
        let state = self.lock();
        let tail = &state.transcript_tail;
        let mut cut = tail.len().saturating_sub(limit);
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail[cut..].to_string()
    }

    pub fn handover(&self) -> Option<String> {
        extract_handover(&self.lock().transcript_tail)
    }

    pub fn report(&self, outcome: SessionOutcome) -> SessionReport {
        SessionReport {
            outcome,
            session_id: self.session_id(),
            cost: self.cost(),
            notes: self.handover(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProgressState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keep the last 64 KiB of assistant text for marker and handover extraction.
fn push_tail(tail: &mut String, text: &str) {
    const TAIL_LIMIT: usize = 64 * 1024;
    tail.push_str(text);
    tail.push('\n');
    if tail.len() > TAIL_LIMIT {
        let mut cut = tail.len() - TAIL_LIMIT;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

fn reason_or(text: &str, fallback: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return fallback.to_string();
    }
    match text.char_indices().nth(REASON_LIMIT) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Session runner that spawns an agent CLI and reads its `stream-json` output.
#[derive(Debug, Clone)]
pub struct CommandSessionRunner {
    command: Vec<String>,
    resume_args: Vec<String>,
    output_limit_bytes: usize,
    cancel_grace: Duration,
}

impl CommandSessionRunner {
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            command: settings.command.clone(),
            resume_args: settings.resume_args.clone(),
            output_limit_bytes: settings.output_limit_bytes,
            cancel_grace: Duration::from_secs(settings.cancel_grace_secs),
        }
    }

    fn build_command(&self, request: &SessionRequest) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("session command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(session_id) = &request.task.session_id {
            for arg in &self.resume_args {
                cmd.arg(arg.replace("{session_id}", session_id));
            }
        }
        cmd.current_dir(&request.workdir).env("NO_COLOR", "1");
        Ok(cmd)
    }
}

impl SessionRunner for CommandSessionRunner {
    #[instrument(skip_all, fields(task_id = %request.task.id, resume = request.task.session_id.is_some()))]
    fn start(&self, request: &SessionRequest) -> Result<Box<dyn Session>> {
        let prompt = render_session_prompt(
            &request.task,
            request.recent_progress.as_deref(),
            &request.workdir,
        )?;
        fs::create_dir_all(&request.log_dir)
            .with_context(|| format!("create session log dir {}", request.log_dir.display()))?;

        let cmd = self.build_command(request)?;
        let progress = Arc::new(SessionProgress::new());
        let sink = Arc::clone(&progress);
        let child = spawn_streaming(
            cmd,
            Some(prompt.as_bytes()),
            Some(&request.log_dir.join("stream.jsonl")),
            self.output_limit_bytes,
            move |line| sink.record_line(line),
        )
        .context("start agent session")?;
        info!(pid = child.id(), "agent session started");

        Ok(Box::new(CommandSession {
            child: Some(child),
            progress,
            log_path: request.log_dir.join("session.log"),
            cancel_grace: self.cancel_grace,
        }))
    }
}

struct CommandSession {
    child: Option<StreamingChild>,
    progress: Arc<SessionProgress>,
    log_path: PathBuf,
    cancel_grace: Duration,
}

impl Session for CommandSession {
    fn progress(&self) -> Arc<SessionProgress> {
        Arc::clone(&self.progress)
    }

    fn try_finish(&mut self) -> Result<Option<SessionReport>> {
        let Some(child) = self.child.as_mut() else {
            return Err(anyhow!("session already finished"));
        };
        let Some(status) = child.try_wait()? else {
            return Ok(None);
        };
        let Some(child) = self.child.take() else {
            return Err(anyhow!("session already finished"));
        };
        match child.collect(status) {
            Ok(output) => {
                if let Err(err) = write_session_log(&self.log_path, &output.render_log("session")) {
                    warn!(err = %format!("{err:#}"), "failed to write session log");
                }
            }
            Err(err) => warn!(err = %format!("{err:#}"), "failed to collect session output"),
        }

        let outcome = self.progress.outcome(status);
        debug!(?outcome, exit_code = ?status.code(), "agent session ended");
        Ok(Some(self.progress.report(outcome)))
    }

    fn cancel(&mut self) -> Result<SessionReport> {
        if let Some(child) = self.child.take() {
            let status = child.terminate(self.cancel_grace)?;
            warn!(exit_code = ?status.code(), "agent session cancelled");
        }
        Ok(self.progress.report(SessionOutcome::Cancelled))
    }
}

impl Drop for CommandSession {
    fn drop(&mut self) {
        if let Some(child) = self.child.take()
            && let Err(err) = child.terminate(self.cancel_grace)
        {
            warn!(err = %format!("{err:#}"), "failed to stop abandoned session");
        }
    }
}

fn write_session_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create session log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write session log {}", path.display()))
}
