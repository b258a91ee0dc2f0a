//! Shared deterministic types for pipeline core logic.
//!
//! These types define stable contracts between the gates, the sandbox and the
//! retry controller. They must not depend on external state or I/O.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::outcome::{ExecutionOutcome, Failure};

/// Binding that carries a scalar result out of the sandbox.
pub const RESULT_VALUE: &str = "result_value";
/// Binding that carries a tabular result out of the sandbox.
pub const RESULT_DF: &str = "result_df";

/// Output shape the generator claims its code produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclaredOutput {
    Value,
    Table,
}

impl DeclaredOutput {
    pub fn binding(self) -> &'static str {
        match self {
            DeclaredOutput::Value => RESULT_VALUE,
            DeclaredOutput::Table => RESULT_DF,
        }
    }
}

/// One attempt produced by the code generator.
///
/// Immutable once handed to the pipeline; a retry always brings a fresh value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSubmission {
    pub text: String,
    #[serde(default)]
    pub declared_output: Option<DeclaredOutput>,
    /// Data path the generator extracted from its own marker line, if any.
    #[serde(default)]
    pub embedded_path_marker: Option<String>,
}

impl CodeSubmission {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            declared_output: None,
            embedded_path_marker: None,
        }
    }

    pub fn with_declared_output(mut self, declared: DeclaredOutput) -> Self {
        self.declared_output = Some(declared);
        self
    }

    pub fn with_path_marker(mut self, path: impl Into<String>) -> Self {
        self.embedded_path_marker = Some(path.into());
        self
    }
}

/// Column metadata produced by the schema inspector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSchema {
    pub columns: Vec<String>,
    #[serde(default)]
    pub dtypes: BTreeMap<String, String>,
}

/// Caller-owned description of the data source. The pipeline only reads `path`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataContext {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub schema: Option<DataSchema>,
}

impl DataContext {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            schema: None,
        }
    }
}

/// Verdict of the static gates for the current iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReviewState {
    #[default]
    Pending,
    Approved,
    NeedsRevision(String),
}

impl ReviewState {
    /// Fold the verdict of the next gate into the current state.
    ///
    /// Transitions only move forward: once a gate asks for a revision, later
    /// approvals cannot clear it, and a `Pending` verdict never rewinds state.
    pub fn then(self, verdict: ReviewState) -> ReviewState {
        match (self, verdict) {
            (ReviewState::NeedsRevision(reason), _) => ReviewState::NeedsRevision(reason),
            (_, ReviewState::NeedsRevision(reason)) => ReviewState::NeedsRevision(reason),
            (ReviewState::Pending, ReviewState::Approved) => ReviewState::Approved,
            (current, ReviewState::Pending) => current,
            (ReviewState::Approved, ReviewState::Approved) => ReviewState::Approved,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, ReviewState::Approved)
    }

    pub fn revision_reason(&self) -> Option<&str> {
        match self {
            ReviewState::NeedsRevision(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Result of one controller stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Proceed to the next stage of the same iteration.
    Continue,
    /// Abandon this iteration; the failure becomes feedback for the regenerator.
    Retry(Failure),
    /// Terminate the request with this outcome.
    Done(ExecutionOutcome),
}
