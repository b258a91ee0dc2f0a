//! Time-boxed execution of submitted code against an injected data handle.
//!
//! The [`Sandbox`] trait decouples the retry controller from the execution
//! backend. [`python::PythonSandbox`] drives an isolated interpreter process;
//! [`embedded::EmbeddedSandbox`] runs a capability-restricted script engine in
//! process. Tests use scripted sandboxes that never execute anything.

pub mod capture;
pub mod chart;
pub mod embedded;
pub mod frame;
pub mod python;

use std::path::PathBuf;

use anyhow::Result;

use crate::cancel::CancelScope;
use crate::core::normalize::RuntimeValue;
use crate::core::outcome::ChartRef;
use crate::io::config::{PipelineConfig, SandboxBackend};

/// Parameters for one sandbox run.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Code to execute, with path marker lines already removed.
    pub code: String,
    /// Validated data file, loaded once and bound read-only as `data_handle`.
    pub data_path: PathBuf,
    pub data_handle: String,
    /// Cap for each of stdout and stderr.
    pub output_limit_bytes: usize,
}

/// Result bindings collected after execution. `None` means never bound.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    pub value: Option<RuntimeValue>,
    pub table: Option<RuntimeValue>,
}

/// Text written by the code, already bounded and carrying truncation notices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Raw result of one sandbox run, before normalization and classification.
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxRun {
    Completed {
        bindings: Bindings,
        output: CapturedOutput,
        charts: Vec<ChartRef>,
    },
    /// The code raised; `exception` is the exception class name.
    Faulted {
        exception: String,
        message: String,
        output: CapturedOutput,
    },
    TimedOut {
        output: CapturedOutput,
    },
    Cancelled,
    /// The data file vanished or could not be read as a table.
    MissingDataPath {
        message: String,
    },
}

/// Abstraction over execution backends.
///
/// `Err` is reserved for infrastructure failures (interpreter missing, broken
/// harness); everything the submitted code can cause is a [`SandboxRun`].
pub trait Sandbox {
    fn execute(&self, request: &SandboxRequest, scope: &CancelScope) -> Result<SandboxRun>;
}

impl<S: Sandbox + ?Sized> Sandbox for &S {
    fn execute(&self, request: &SandboxRequest, scope: &CancelScope) -> Result<SandboxRun> {
        (**self).execute(request, scope)
    }
}

impl<S: Sandbox + ?Sized> Sandbox for Box<S> {
    fn execute(&self, request: &SandboxRequest, scope: &CancelScope) -> Result<SandboxRun> {
        (**self).execute(request, scope)
    }
}

/// Backend selected by the configuration.
pub fn from_config(config: &PipelineConfig) -> Box<dyn Sandbox> {
    match config.backend {
        SandboxBackend::Python => {
            Box::new(python::PythonSandbox::new(config.python.command.clone()))
        }
        SandboxBackend::Embedded => Box::new(embedded::EmbeddedSandbox::new()),
    }
}
