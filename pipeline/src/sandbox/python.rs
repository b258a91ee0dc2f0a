//! Out-of-process backend driving an isolated Python interpreter.
//!
//! Each run gets a scratch directory holding the harness script. The
//! interpreter starts in isolated mode with a cleared environment, reads one
//! JSON request on stdin and answers with one envelope line on stdout, tagged
//! with a nonce fresh to the run. The envelope is schema-checked before it is
//! trusted.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::{CancelScope, StopReason};
use crate::core::normalize::RuntimeValue;
use crate::core::outcome::{ChartRef, WireChart};
use crate::io::process::run_command_with_timeout;
use crate::sandbox::capture::with_notice;
use crate::sandbox::{Bindings, CapturedOutput, Sandbox, SandboxRequest, SandboxRun};

const HARNESS: &str = include_str!("harness.py");
const ENVELOPE_SCHEMA: &str = include_str!("envelope.schema.json");
const ENVELOPE_PREFIX: &str = "@@INSIGHT_ENVELOPE@@ ";
/// Raw stdout kept from the interpreter; charts travel inside the envelope.
const ENVELOPE_LIMIT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct HarnessRequest<'a> {
    nonce: &'a str,
    code: &'a str,
    data_path: &'a Path,
    data_handle: &'a str,
    output_limit_bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Envelope {
    Completed {
        #[serde(default)]
        result_value: Option<RuntimeValue>,
        #[serde(default)]
        result_df: Option<RuntimeValue>,
        #[serde(default)]
        charts: Vec<WireChart>,
        stdout: String,
        #[serde(default)]
        stdout_truncated: usize,
        stderr: String,
        #[serde(default)]
        stderr_truncated: usize,
    },
    Faulted {
        exception: String,
        message: String,
        stdout: String,
        #[serde(default)]
        stdout_truncated: usize,
        stderr: String,
        #[serde(default)]
        stderr_truncated: usize,
    },
    MissingData {
        message: String,
    },
    BootstrapFailed {
        message: String,
    },
}

/// Python interpreter backend.
#[derive(Debug, Clone)]
pub struct PythonSandbox {
    /// Interpreter invocation, e.g. `["python3"]` or `["uv", "run", "python"]`.
    command: Vec<String>,
}

impl PythonSandbox {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    fn build_command(&self, workdir: &Path, harness: &Path) -> Result<Command> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("python.command must be a non-empty array"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("-I")
            .arg("-B")
            .arg(harness)
            .current_dir(workdir)
            .env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", workdir)
            .env("MPLCONFIGDIR", workdir)
            .env("MPLBACKEND", "Agg")
            .env("PYTHONIOENCODING", "utf-8");
        Ok(cmd)
    }
}

impl Sandbox for PythonSandbox {
    #[instrument(skip_all, fields(backend = "python", data_path = %request.data_path.display()))]
    fn execute(&self, request: &SandboxRequest, scope: &CancelScope) -> Result<SandboxRun> {
        if let Some(reason) = scope.check() {
            return Ok(stopped(reason, CapturedOutput::default()));
        }

        let workdir = tempfile::Builder::new()
            .prefix("insight-sandbox-")
            .tempdir()
            .context("create sandbox workdir")?;
        let harness = workdir.path().join("harness.py");
        fs::write(&harness, HARNESS).with_context(|| format!("write {}", harness.display()))?;

        let nonce = Uuid::new_v4().simple().to_string();
        let payload = serde_json::to_vec(&HarnessRequest {
            nonce: &nonce,
            code: &request.code,
            data_path: &request.data_path,
            data_handle: &request.data_handle,
            output_limit_bytes: request.output_limit_bytes,
        })
        .context("serialize harness request")?;

        info!(interpreter = %self.command.join(" "), "starting python sandbox");
        let cmd = self.build_command(workdir.path(), &harness)?;
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            scope,
            ENVELOPE_LIMIT_BYTES,
            request.output_limit_bytes,
        )
        .context("run python sandbox")?;

        let process_stderr = with_notice(output.stderr_lossy(), output.stderr_truncated, "stderr");
        if let Some(reason) = output.stopped {
            return Ok(stopped(
                reason,
                CapturedOutput {
                    stdout: String::new(),
                    stderr: process_stderr,
                },
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(raw) = last_envelope_line(&stdout, &nonce) else {
            warn!(exit_code = ?output.status.code(), "python sandbox produced no envelope");
            return Ok(SandboxRun::Faulted {
                exception: "ProcessExit".to_string(),
                message: format!(
                    "interpreter exited with status {} before reporting a result",
                    output
                        .status
                        .code()
                        .map_or_else(|| "unknown".to_string(), |code| code.to_string())
                ),
                output: CapturedOutput {
                    stdout: String::new(),
                    stderr: process_stderr,
                },
            });
        };

        let envelope = parse_envelope(raw)?;
        into_run(envelope)
    }
}

fn stopped(reason: StopReason, output: CapturedOutput) -> SandboxRun {
    match reason {
        StopReason::Cancelled => SandboxRun::Cancelled,
        StopReason::TimedOut => SandboxRun::TimedOut { output },
    }
}

/// Last line carrying this run's envelope tag. Lines with any other nonce were
/// written by the submission and are ignored.
fn last_envelope_line<'a>(stdout: &'a str, nonce: &str) -> Option<&'a str> {
    stdout.lines().rev().find_map(|line| {
        line.strip_prefix(ENVELOPE_PREFIX)?
            .strip_prefix(nonce)?
            .strip_prefix(' ')
    })
}

fn parse_envelope(raw: &str) -> Result<Envelope> {
    let value: Value = serde_json::from_str(raw).context("parse sandbox envelope")?;
    validate_envelope(&value)?;
    serde_json::from_value(value).context("decode sandbox envelope")
}

/// Validate the envelope against its JSON Schema (Draft 2020-12).
fn validate_envelope(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(ENVELOPE_SCHEMA).context("parse envelope schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile envelope schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!(
            "sandbox envelope failed validation:\n- {}",
            messages.join("\n- ")
        );
    }
    Ok(())
}

fn into_run(envelope: Envelope) -> Result<SandboxRun> {
    match envelope {
        Envelope::Completed {
            result_value,
            result_df,
            charts,
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
        } => {
            let charts = charts
                .into_iter()
                .map(decode_chart)
                .collect::<Result<Vec<_>>>()?;
            debug!(charts = charts.len(), "python run completed");
            Ok(SandboxRun::Completed {
                bindings: Bindings {
                    value: result_value,
                    table: result_df,
                },
                output: CapturedOutput {
                    stdout: with_notice(stdout, stdout_truncated, "stdout"),
                    stderr: with_notice(stderr, stderr_truncated, "stderr"),
                },
                charts,
            })
        }
        Envelope::Faulted {
            exception,
            message,
            stdout,
            stdout_truncated,
            stderr,
            stderr_truncated,
        } => {
            debug!(%exception, "python run faulted");
            Ok(SandboxRun::Faulted {
                exception,
                message,
                output: CapturedOutput {
                    stdout: with_notice(stdout, stdout_truncated, "stdout"),
                    stderr: with_notice(stderr, stderr_truncated, "stderr"),
                },
            })
        }
        Envelope::MissingData { message } => Ok(SandboxRun::MissingDataPath { message }),
        Envelope::BootstrapFailed { message } => {
            bail!("python sandbox bootstrap failed: {message}")
        }
    }
}

fn decode_chart(chart: WireChart) -> Result<ChartRef> {
    let data = BASE64_STANDARD
        .decode(chart.data_base64.as_bytes())
        .with_context(|| format!("decode chart {}", chart.filename))?;
    Ok(ChartRef {
        filename: chart.filename,
        mime_type: chart.mime_type,
        data,
    })
}
