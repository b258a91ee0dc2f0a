//! Helpers for running child processes under a cancel scope with bounded output.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::{CancelScope, StopReason};

/// Longest single wait between cancellation checks.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    /// Set when the child was killed because the scope expired or was cancelled.
    pub stopped: Option<StopReason>,
}

impl CommandOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
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
}

/// Run a command until it exits or `scope` stops it, capturing stdout/stderr
/// without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. Bytes beyond each limit
/// are discarded while still draining the pipe. The child is killed and reaped
/// before returning whenever the scope stops it.
#[instrument(skip_all, fields(timeout_secs = scope.timeout().map(|t| t.as_secs()), stdout_limit, stderr_limit))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    scope: &CancelScope,
    stdout_limit: usize,
    stderr_limit: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, stdout_limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, stderr_limit));

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                // A child that exits or is killed before reading its input is
                // reported through its status.
                if let Err(e) = child_stdin.write_all(&input) {
                    warn!(err = %e, "child closed stdin early");
                }
            }))
        }
        None => None,
    };

    let mut stopped = None;
    let status = loop {
        if let Some(reason) = scope.check() {
            warn!(reason = reason.as_str(), "stopping child process");
            stopped = Some(reason);
            child.kill().context("kill command")?;
            break child.wait().context("wait command after kill")?;
        }
        let slice = scope
            .remaining()
            .map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
    };

    if let Some(handle) = stdin_handle {
        handle
            .join()
            .map_err(|_| anyhow!("stdin writer thread panicked"))?;
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), stopped = ?stopped, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        stopped,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
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
