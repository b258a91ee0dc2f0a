//! Execution outcomes, the failure taxonomy, and the presentation wire shape.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// One normalized table row: column name to cell, in column order.
pub type Row = Map<String, Value>;

/// Failure taxonomy shared by the gates, the sandbox and the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A disallowed pattern matched; the code never runs.
    SafetyViolation,
    /// Output binding or data handle reference missing; the code never runs.
    StructuralDefect,
    /// No resolvable data path. Fatal: retrying cannot fix a caller contract violation.
    MissingDataPath,
    Timeout,
    /// Exception raised by the submitted code itself.
    RuntimeFault,
    /// Result contains a value with no transport representation.
    SerializationError,
    /// Iteration budget spent; wraps the last retryable failure.
    BudgetExhausted,
    /// The caller aborted the request.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SafetyViolation => "SafetyViolation",
            ErrorKind::StructuralDefect => "StructuralDefect",
            ErrorKind::MissingDataPath => "MissingDataPath",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RuntimeFault => "RuntimeFault",
            ErrorKind::SerializationError => "SerializationError",
            ErrorKind::BudgetExhausted => "BudgetExhausted",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// True when another generated attempt could plausibly succeed.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::MissingDataPath | ErrorKind::BudgetExhausted | ErrorKind::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure of one iteration or of the whole request.
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
    /// Exception class reported by the sandbox (`RuntimeFault` only).
    pub exception: Option<String>,
    /// Last retryable failure, set on `BudgetExhausted`.
    pub cause: Option<Box<Failure>>,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exception: None,
            cause: None,
        }
    }

    pub fn runtime_fault(exception: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception: Some(exception.into()),
            ..Self::new(ErrorKind::RuntimeFault, message)
        }
    }

    /// Terminal failure after `attempts` iterations, wrapping the last failure if any.
    pub fn budget_exhausted(attempts: u32, last: Option<Failure>) -> Self {
        let message = match &last {
            Some(last) => format!(
                "iteration budget exhausted after {attempts} attempt(s); last failure: {}",
                last.detail()
            ),
            None => format!("iteration budget exhausted after {attempts} attempt(s)"),
        };
        Self {
            cause: last.map(Box::new),
            ..Self::new(ErrorKind::BudgetExhausted, message)
        }
    }

    /// Message including the exception class when the sandbox reported one.
    pub fn detail(&self) -> String {
        match &self.exception {
            Some(exception) => format!("{exception}: {}", self.message),
            None => self.message.clone(),
        }
    }

    /// The failure the user sees: the wrapped cause for `BudgetExhausted`, else `self`.
    pub fn reported(&self) -> &Failure {
        match &self.cause {
            Some(cause) => cause.reported(),
            None => self,
        }
    }
}

/// Byte-encoded figure produced during execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRef {
    pub filename: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Successful execution payload. Every value is already transport-safe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Success {
    pub value: Option<Value>,
    pub table: Option<Vec<Row>>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub charts: Vec<ChartRef>,
}

impl Success {
    /// False for diagnostic-only runs that bound neither `result_value` nor `result_df`.
    pub fn has_result(&self) -> bool {
        self.value.is_some() || self.table.is_some()
    }
}

/// Terminal payload of one executed iteration, or of the whole request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success(Success),
    Failure(Failure),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ExecutionOutcome::Failure(failure) => Some(failure),
            ExecutionOutcome::Success(_) => None,
        }
    }

    pub fn to_wire(&self) -> WireOutcome {
        match self {
            ExecutionOutcome::Success(success) => WireOutcome {
                status: WireStatus::Success,
                value: success.value.clone(),
                table: success.table.clone(),
                charts: (!success.charts.is_empty())
                    .then(|| success.charts.iter().map(WireChart::from).collect()),
                stdout: success.stdout.clone().filter(|s| !s.is_empty()),
                stderr: success.stderr.clone().filter(|s| !s.is_empty()),
                error_message: None,
                error_type: None,
            },
            ExecutionOutcome::Failure(failure) => {
                let reported = failure.reported();
                WireOutcome {
                    status: WireStatus::Error,
                    value: None,
                    table: None,
                    charts: None,
                    stdout: None,
                    stderr: None,
                    error_message: Some(reported.detail()),
                    error_type: Some(reported.kind.as_str().to_string()),
                }
            }
        }
    }
}

impl Serialize for ExecutionOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    Success,
    Error,
}

/// Outcome shape handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOutcome {
    pub status: WireStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charts: Option<Vec<WireChart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireChart {
    pub filename: String,
    pub mime_type: String,
    pub data_base64: String,
}

impl From<&ChartRef> for WireChart {
    fn from(chart: &ChartRef) -> Self {
        Self {
            filename: chart.filename.clone(),
            mime_type: chart.mime_type.clone(),
            data_base64: BASE64_STANDARD.encode(&chart.data),
        }
    }
}
