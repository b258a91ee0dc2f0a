//! Test-only doubles: scripted sandboxes and regenerators, plus scratch data dirs.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::cancel::{CancelScope, CancelToken};
use crate::core::normalize::RuntimeValue;
use crate::core::outcome::Failure;
use crate::core::types::{CodeSubmission, DataContext};
use crate::io::regenerator::{RegenerateRequest, Regenerator};
use crate::sandbox::{Bindings, CapturedOutput, Sandbox, SandboxRequest, SandboxRun};

/// Small sales table used across tests.
pub const SALES_CSV: &str = "\
region,product,units,price
North,Widget,10,2.5
South,Gadget,4,10.0
North,Gadget,6,10.0
";

/// Sandbox that replays predetermined runs and records what it was asked to execute.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    runs: RefCell<VecDeque<SandboxRun>>,
    calls: Cell<u32>,
    codes: RefCell<Vec<String>>,
    infra_error: Option<String>,
}

impl ScriptedSandbox {
    pub fn new(runs: Vec<SandboxRun>) -> Self {
        Self {
            runs: RefCell::new(runs.into()),
            ..Self::default()
        }
    }

    /// Every call fails with an infrastructure error.
    pub fn failing(mut self, message: &str) -> Self {
        self.infra_error = Some(message.to_string());
        self
    }

    /// Number of `execute` calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    /// Code passed to each `execute` call, in order.
    pub fn codes(&self) -> Vec<String> {
        self.codes.borrow().clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(&self, request: &SandboxRequest, _scope: &CancelScope) -> Result<SandboxRun> {
        self.calls.set(self.calls.get() + 1);
        self.codes.borrow_mut().push(request.code.clone());
        if let Some(message) = &self.infra_error {
            return Err(anyhow!(message.clone()));
        }
        self.runs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted sandbox ran out of runs"))
    }
}

/// Wraps a real sandbox and counts how often it is asked to execute.
#[derive(Debug, Default)]
pub struct CountingSandbox<S> {
    inner: S,
    calls: Cell<u32>,
}

impl<S: Sandbox> CountingSandbox<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: Cell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }
}

impl<S: Sandbox> Sandbox for CountingSandbox<S> {
    fn execute(&self, request: &SandboxRequest, scope: &CancelScope) -> Result<SandboxRun> {
        self.calls.set(self.calls.get() + 1);
        self.inner.execute(request, scope)
    }
}

/// Completed run that bound only `result_value`.
pub fn completed_value(value: RuntimeValue) -> SandboxRun {
    SandboxRun::Completed {
        bindings: Bindings {
            value: Some(value),
            table: None,
        },
        output: CapturedOutput::default(),
        charts: Vec::new(),
    }
}

/// Regenerator that hands out predetermined replies, then declines.
#[derive(Debug, Default)]
pub struct ScriptedRegenerator {
    replies: VecDeque<Option<CodeSubmission>>,
    feedback: Vec<Failure>,
}

impl ScriptedRegenerator {
    pub fn new(replies: Vec<Option<CodeSubmission>>) -> Self {
        Self {
            replies: replies.into(),
            feedback: Vec::new(),
        }
    }

    /// Failures received so far, in order.
    pub fn feedback(&self) -> &[Failure] {
        &self.feedback
    }
}

impl Regenerator for ScriptedRegenerator {
    fn regenerate(
        &mut self,
        request: &RegenerateRequest<'_>,
        _token: &CancelToken,
    ) -> Result<Option<CodeSubmission>> {
        self.feedback.push(request.feedback.clone());
        Ok(self.replies.pop_front().flatten())
    }
}

/// Scratch data root holding CSV files.
#[derive(Debug)]
pub struct DataDir {
    dir: TempDir,
}

impl DataDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    /// Data root containing `sales.csv` with [`SALES_CSV`].
    pub fn with_sales_csv() -> Self {
        let data = Self::new();
        data.write("sales.csv", SALES_CSV);
        data
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, contents).expect("write data file");
        path
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Context pointing at `sales.csv`.
    pub fn context(&self) -> DataContext {
        DataContext::with_path(self.dir.path().join("sales.csv"))
    }
}

impl Default for DataDir {
    fn default() -> Self {
        Self::new()
    }
}
