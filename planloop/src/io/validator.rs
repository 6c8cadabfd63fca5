//! Validation adapter: runs the project's check command after a session.
//!
//! A zero exit is a pass. Anything else, including a timeout, is a failure
//! whose diagnostic ends up on the task and in the re-planner prompt.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Verdict;
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Longest diagnostic copied into a failure message.
const DIAGNOSTIC_LIMIT: usize = 2000;

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    /// `None` waits for the command however long it takes.
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

pub trait Validator {
    fn validate(&self, request: &ValidationRequest) -> Result<Verdict>;
}

/// Runs a configured command such as `just ci`.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    command: Vec<String>,
}

impl CommandValidator {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Validator for CommandValidator {
    #[instrument(skip_all, fields(command = %self.command.join(" ")))]
    fn validate(&self, request: &ValidationRequest) -> Result<Verdict> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("validation command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        info!("running validation");
        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run validation command")?;
        write_validation_log(&request.log_path, &output)?;

        if output.timed_out {
            let limit = request.timeout.map(|t| t.as_secs()).unwrap_or_default();
            warn!(timeout_secs = limit, "validation timed out");
            return Ok(Verdict::Fail(format!("validation timed out after {limit}s")));
        }
        if output.status.success() {
            debug!("validation passed");
            return Ok(Verdict::Pass);
        }

        let code = match output.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        warn!(exit = %code, "validation failed");
        let diagnostic = diagnostic_tail(&output);
        if diagnostic.is_empty() {
            Ok(Verdict::Fail(code))
        } else {
            Ok(Verdict::Fail(format!("{code}\n{diagnostic}")))
        }
    }
}

/// Tail of stderr, or stdout when stderr is empty.
fn diagnostic_tail(output: &CommandOutput) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        stderr.into_owned()
    };
    let text = text.trim();
    let chars = text.chars().count();
    if chars <= DIAGNOSTIC_LIMIT {
        return text.to_string();
    }
    let tail: String = text.chars().skip(chars - DIAGNOSTIC_LIMIT).collect();
    format!("...{tail}")
}

fn write_validation_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create validation log dir {}", parent.display()))?;
    }
    fs::write(path, output.render_log("validation"))
        .with_context(|| format!("write validation log {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(dir: &Path, timeout: Option<Duration>) -> ValidationRequest {
        ValidationRequest {
            workdir: dir.to_path_buf(),
            log_path: dir.join("logs/validation.log"),
            timeout,
            output_limit_bytes: 10_000,
        }
    }

    fn sh(script: &str) -> CommandValidator {
        CommandValidator::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[test]
    fn zero_exit_passes_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verdict = sh("echo all green")
            .validate(&request(temp.path(), None))
            .expect("validate");

        assert_eq!(verdict, Verdict::Pass);
        let log = fs::read_to_string(temp.path().join("logs/validation.log")).expect("log");
        assert!(log.contains("all green"));
    }

    /// Verifies the failure carries the exit code and the stderr tail.
    #[test]
    fn non_zero_exit_fails_with_diagnostic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verdict = sh("echo 'test parser::eof failed' >&2; exit 2")
            .validate(&request(temp.path(), None))
            .expect("validate");

        assert_eq!(
            verdict,
            Verdict::Fail("exit code 2\ntest parser::eof failed".to_string())
        );
    }

    #[test]
    fn timeout_is_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let verdict = CommandValidator::new(vec!["sleep".into(), "5".into()])
            .validate(&request(temp.path(), Some(Duration::from_millis(100))))
            .expect("validate");

        assert_eq!(verdict, Verdict::Fail("validation timed out after 0s".to_string()));
    }

    #[test]
    fn missing_program_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = CommandValidator::new(vec!["planloop-no-such-binary".into()])
            .validate(&request(temp.path(), None))
            .unwrap_err();
        assert!(format!("{err:#}").contains("spawn planloop-no-such-binary"));
    }
}
