//! Sources of fresh code submissions between iterations.
//!
//! The [`Regenerator`] trait decouples the retry controller from whatever
//! produces code (an LLM wrapper script, a human, a fixture). Tests use
//! scripted regenerators that hand out predetermined submissions.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelScope, CancelToken, StopReason};
use crate::core::outcome::Failure;
use crate::core::types::{CodeSubmission, DataContext};
use crate::io::config::RegeneratorConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::{FeedbackInputs, render_feedback};

/// Largest submission accepted from a regenerator command.
const SUBMISSION_LIMIT_BYTES: usize = 1024 * 1024;
const STDERR_LIMIT_BYTES: usize = 64 * 1024;

/// Everything a regenerator may use to produce the next attempt.
#[derive(Debug, Clone, Copy)]
pub struct RegenerateRequest<'a> {
    /// Iteration whose failure is being fed back (1-based).
    pub iteration: u32,
    pub previous: &'a CodeSubmission,
    pub feedback: &'a Failure,
    pub data: &'a DataContext,
    pub data_handle: &'a str,
}

pub trait Regenerator {
    /// Produce the next submission, or `None` to give up on the request.
    fn regenerate(
        &mut self,
        request: &RegenerateRequest<'_>,
        token: &CancelToken,
    ) -> Result<Option<CodeSubmission>>;
}

impl<R: Regenerator + ?Sized> Regenerator for &mut R {
    fn regenerate(
        &mut self,
        request: &RegenerateRequest<'_>,
        token: &CancelToken,
    ) -> Result<Option<CodeSubmission>> {
        (**self).regenerate(request, token)
    }
}

impl<R: Regenerator + ?Sized> Regenerator for Box<R> {
    fn regenerate(
        &mut self,
        request: &RegenerateRequest<'_>,
        token: &CancelToken,
    ) -> Result<Option<CodeSubmission>> {
        (**self).regenerate(request, token)
    }
}

/// Offers the previous submission again unchanged.
///
/// Useful when failures may be transient, and as the default when no
/// generator is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resubmit;

impl Regenerator for Resubmit {
    fn regenerate(
        &mut self,
        request: &RegenerateRequest<'_>,
        _token: &CancelToken,
    ) -> Result<Option<CodeSubmission>> {
        Ok(Some(request.previous.clone()))
    }
}

/// Runs an external command: feedback prompt on stdin, new code on stdout.
///
/// Empty output declines the retry. A non-zero exit or timeout is an error.
#[derive(Debug, Clone)]
pub struct CommandRegenerator {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandRegenerator {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// `None` when the config names no command.
    pub fn from_config(config: &RegeneratorConfig) -> Option<Self> {
        (!config.command.is_empty()).then(|| {
            Self::new(
                config.command.clone(),
                Duration::from_secs(config.timeout_secs),
            )
        })
    }
}

impl Regenerator for CommandRegenerator {
    #[instrument(skip_all, fields(iteration = request.iteration, error_type = request.feedback.kind.as_str()))]
    fn regenerate(
        &mut self,
        request: &RegenerateRequest<'_>,
        token: &CancelToken,
    ) -> Result<Option<CodeSubmission>> {
        let prompt = render_feedback(&FeedbackInputs {
            iteration: request.iteration,
            previous: request.previous,
            failure: request.feedback,
            data: request.data,
            data_handle: request.data_handle,
        })?;

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("regenerator.command must be a non-empty array"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        info!(command = %self.command.join(" "), "requesting regenerated code");
        let scope = CancelScope::new(token, Some(self.timeout));
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            &scope,
            SUBMISSION_LIMIT_BYTES,
            STDERR_LIMIT_BYTES,
        )
        .context("run regenerator command")?;

        match output.stopped {
            Some(StopReason::Cancelled) => return Ok(None),
            Some(StopReason::TimedOut) => {
                bail!(
                    "regenerator command timed out after {}s",
                    self.timeout.as_secs()
                )
            }
            None => {}
        }
        if !output.status.success() {
            bail!(
                "regenerator command exited with {}: {}{}",
                output.status,
                output.stderr_lossy().trim(),
                output.stderr_truncated_notice("regenerator")
            );
        }
        if output.stdout_truncated > 0 {
            bail!("regenerator output exceeded {SUBMISSION_LIMIT_BYTES} bytes");
        }

        let stdout = String::from_utf8(output.stdout).context("regenerator output is not utf-8")?;
        let code = strip_code_fence(&stdout);
        if code.trim().is_empty() {
            warn!("regenerator returned no code");
            return Ok(None);
        }
        debug!(bytes = code.len(), "received regenerated code");
        Ok(Some(CodeSubmission {
            text: code.to_string(),
            declared_output: request.previous.declared_output,
            embedded_path_marker: request.previous.embedded_path_marker.clone(),
        }))
    }
}

/// Body of a single fenced block (```` ```python ... ``` ````), else the trimmed text.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    match body.split_once('\n') {
        Some((_info, code)) => code.trim_matches('\n'),
        None => body.trim(),
    }
}
