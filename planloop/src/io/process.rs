//! Helpers for running child processes with bounded output.
//!
//! Two shapes are supported:
//! - [`run_command_with_timeout`]: run to completion (validator, re-planner).
//! - [`spawn_streaming`]: start a long-running child whose stdout lines are
//!   tee'd to a file and handed to a callback while the caller keeps polling
//!   (agent sessions).

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// Render stdout and stderr as one log document.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str(&self.stdout_truncated_notice(label));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        buf.push_str(&self.stderr_truncated_notice(label));
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run a command to completion and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// A `timeout` of `None` waits indefinitely.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin.is_some())?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        write_stdin(child.stdin.take(), input)?;
    }

    let mut timed_out = false;
    let status = match timeout {
        None => child.wait().context("wait for command")?,
        Some(limit) => match child.wait_timeout(limit).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

type ReaderHandle = thread::JoinHandle<Result<(Vec<u8>, usize)>>;

/// A running child whose stdout is being streamed line by line.
pub struct StreamingChild {
    child: Child,
    stdout_handle: Option<ReaderHandle>,
    stderr_handle: Option<ReaderHandle>,
}

/// Spawn `cmd`, write `stdin`, and stream stdout lines to `stream_path` and `on_line`.
///
/// Returns immediately; use [`StreamingChild::try_wait`] to poll.
#[instrument(skip_all, fields(output_limit_bytes, streaming = stream_path.is_some()))]
pub fn spawn_streaming<F>(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    stream_path: Option<&Path>,
    output_limit_bytes: usize,
    on_line: F,
) -> Result<StreamingChild>
where
    F: FnMut(&str) + Send + 'static,
{
    let stream_file = match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    let mut child = spawn_piped(&mut cmd, stdin.is_some())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || {
        read_lines_with_tee(stdout, output_limit_bytes, stream_file, on_line)
    });
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    if let Some(input) = stdin {
        write_stdin(child.stdin.take(), input)?;
    }

    debug!(pid = child.id(), "streaming child started");
    Ok(StreamingChild {
        child,
        stdout_handle: Some(stdout_handle),
        stderr_handle: Some(stderr_handle),
    })
}

impl StreamingChild {
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().context("poll child process")
    }

    /// Join the output readers of an exited child.
    pub fn collect(mut self, status: ExitStatus) -> Result<CommandOutput> {
        let (stdout, stdout_truncated) = match self.stdout_handle.take() {
            Some(handle) => join_output(handle).context("join stdout")?,
            None => (Vec::new(), 0),
        };
        let (stderr, stderr_truncated) = match self.stderr_handle.take() {
            Some(handle) => join_output(handle).context("join stderr")?,
            None => (Vec::new(), 0),
        };
        Ok(CommandOutput {
            status,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out: false,
        })
    }

    /// Ask the child to stop, escalating to a kill after `grace`.
    ///
    /// Reader threads are detached rather than joined: a grandchild may keep
    /// the pipes open after the child itself is gone.
    #[instrument(skip_all, fields(pid = self.child.id(), grace_ms = grace.as_millis() as u64))]
    pub fn terminate(mut self, grace: Duration) -> Result<ExitStatus> {
        if let Some(status) = self.try_wait()? {
            return Ok(status);
        }
        send_interrupt(self.child.id());
        if let Some(status) = self
            .child
            .wait_timeout(grace)
            .context("wait for child after interrupt")?
        {
            debug!(exit_code = ?status.code(), "child stopped after interrupt");
            return Ok(status);
        }
        warn!("child ignored interrupt, killing");
        match self.child.kill() {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
            Err(err) => return Err(err).context("kill child"),
        }
        self.child.wait().context("wait child after kill")
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    // Children lead their own process group; signal the whole group.
    let result = Command::new("kill")
        .args(["-INT", "--"])
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(err) = result {
        warn!(err = %err, pid, "failed to send interrupt");
    }
}

#[cfg(not(unix))]
fn send_interrupt(pid: u32) {
    debug!(pid, "no interrupt signal on this platform, waiting for grace period");
}

fn spawn_piped(cmd: &mut Command, pipe_stdin: bool) -> Result<Child> {
    if pipe_stdin {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Keep children out of the terminal's foreground group so Ctrl+C only
    // reaches planloop, which then decides how to stop them.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            error!(err = %e, program = ?cmd.get_program(), "failed to spawn command");
            Err(e).with_context(|| format!("spawn {}", cmd.get_program().to_string_lossy()))
        }
    }
}

/// Write the whole input, then close stdin. A child that exits without
/// reading its input is not an error.
fn write_stdin(stdin: Option<ChildStdin>, input: &[u8]) -> Result<()> {
    let mut child_stdin = stdin.ok_or_else(|| anyhow!("stdin was not piped"))?;
    match child_stdin.write_all(input) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            debug!("child closed stdin before reading all input");
            Ok(())
        }
        Err(err) => Err(err).context("write stdin"),
    }
}

fn join_output(handle: ReaderHandle) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read lines with a size limit, tee-ing each line to a file and a callback.
fn read_lines_with_tee<R: Read, F: FnMut(&str)>(
    reader: R,
    limit: usize,
    mut stream_file: Option<BufWriter<File>>,
    mut on_line: F,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(writer) = stream_file.as_mut() {
            // Flush per line so the stream can be tailed live.
            if let Err(e) = writer.write_all(&line).and_then(|()| writer.flush()) {
                warn!(err = %e, "failed to write to stream file");
            }
        }
        on_line(String::from_utf8_lossy(&line).trim_end());

        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn sleep(secs: u32) -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg(secs.to_string());
        cmd
    }

    #[test]
    fn captures_output_and_truncates() {
        let output = run_command_with_timeout(sh("printf 'abcdef'; echo err >&2"), None, None, 3)
            .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"abc");
        assert_eq!(output.stdout_truncated, 3);
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
    }

    #[test]
    fn passes_stdin_through() {
        let output = run_command_with_timeout(Command::new("cat"), Some(b"hello"), None, 100)
            .expect("run");
        assert_eq!(output.stdout, b"hello");
    }

    /// Children lead their own process group, out of reach of a terminal Ctrl+C.
    #[cfg(target_os = "linux")]
    #[test]
    fn children_run_in_their_own_process_group() {
        let output = run_command_with_timeout(
            sh("echo $$; cut -d' ' -f5 /proc/$$/stat"),
            None,
            None,
            100,
        )
        .expect("run");
        let text = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        assert_eq!(lines.len(), 2, "{text}");
        assert_eq!(lines[0], lines[1], "child should be its own group leader");
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_command_with_timeout(
            sleep(5),
            None,
            Some(Duration::from_millis(100)),
            100,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    #[test]
    fn streams_lines_to_file_and_callback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream_path = temp.path().join("logs/stream.jsonl");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut child = spawn_streaming(
            sh("echo one; echo two"),
            None,
            Some(&stream_path),
            1000,
            move |line| sink.lock().expect("lock").push(line.to_string()),
        )
        .expect("spawn");

        let deadline = Instant::now() + Duration::from_secs(10);
        let status = loop {
            if let Some(status) = child.try_wait().expect("poll") {
                break status;
            }
            assert!(Instant::now() < deadline, "child did not exit");
            thread::sleep(Duration::from_millis(10));
        };
        let output = child.collect(status).expect("collect");

        assert_eq!(output.stdout, b"one\ntwo\n");
        assert_eq!(*seen.lock().expect("lock"), vec!["one", "two"]);
        let streamed = std::fs::read_to_string(&stream_path).expect("read stream");
        assert_eq!(streamed, "one\ntwo\n");
    }

    #[test]
    fn terminate_stops_long_running_child() {
        let child = spawn_streaming(
            sleep(30),
            None,
            None,
            100,
            |_| {},
        )
        .expect("spawn");
        let started = Instant::now();
        let status = child.terminate(Duration::from_secs(2)).expect("terminate");
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
