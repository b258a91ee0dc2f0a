//! Lexical structure checks: output binding and data handle reference.
//!
//! Purely regex-based, so the cost is linear in the code size and nothing is
//! ever executed here.

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::types::{CodeSubmission, DeclaredOutput, RESULT_DF, RESULT_VALUE, ReviewState};

#[derive(Debug, Clone)]
pub struct StructuralValidator {
    data_handle: String,
    require_data_handle: bool,
    handle_ref: Regex,
    value_assign: Regex,
    table_assign: Regex,
}

impl StructuralValidator {
    pub fn new(data_handle: &str, require_data_handle: bool) -> Result<Self> {
        Ok(Self {
            data_handle: data_handle.to_string(),
            require_data_handle,
            handle_ref: word_regex(data_handle)?,
            value_assign: assignment_regex(RESULT_VALUE)?,
            table_assign: assignment_regex(RESULT_DF)?,
        })
    }

    /// Human-readable list of missing structural elements (empty when valid).
    pub fn missing(&self, submission: &CodeSubmission) -> Vec<String> {
        let code = submission.text.as_str();
        let mut missing = Vec::new();

        if self.require_data_handle && !self.handle_ref.is_match(code) {
            missing.push(format!(
                "code never references the data handle `{}`",
                self.data_handle
            ));
        }

        let assigns_value = self.value_assign.is_match(code);
        let assigns_table = self.table_assign.is_match(code);
        match submission.declared_output {
            Some(DeclaredOutput::Value) if !assigns_value => {
                missing.push(format!(
                    "declared a scalar result but never assigns `{RESULT_VALUE}`"
                ));
            }
            Some(DeclaredOutput::Table) if !assigns_table => {
                missing.push(format!("declared a table result but never assigns `{RESULT_DF}`"));
            }
            None if !assigns_value && !assigns_table => {
                missing.push(format!("no assignment to `{RESULT_VALUE}` or `{RESULT_DF}`"));
            }
            _ => {}
        }
        missing
    }

    pub fn review(&self, submission: &CodeSubmission) -> ReviewState {
        let missing = self.missing(submission);
        if missing.is_empty() {
            ReviewState::Approved
        } else {
            ReviewState::NeedsRevision(format!("code is incomplete: {}", missing.join("; ")))
        }
    }
}

fn word_regex(ident: &str) -> Result<Regex> {
    Regex::new(&format!(r"\b{}\b", regex::escape(ident)))
        .with_context(|| format!("compile reference pattern for `{ident}`"))
}

/// Matches `name = ...` and `name: T = ...` but not `name == ...`.
fn assignment_regex(name: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"(?m)\b{}\s*(?::[^=\n]*)?=(?:[^=]|$)",
        regex::escape(name)
    ))
    .with_context(|| format!("compile assignment pattern for `{name}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(require_data_handle: bool) -> StructuralValidator {
        StructuralValidator::new("df", require_data_handle).expect("validator")
    }

    #[test]
    fn scalar_assignment_is_approved() {
        let state = validator(false).review(&CodeSubmission::new("result_value = 2 + 2"));
        assert!(state.is_approved());
    }

    #[test]
    fn annotated_table_assignment_is_approved() {
        let code = "result_df: pd.DataFrame = df.groupby('region').sum()";
        assert!(validator(true).review(&CodeSubmission::new(code)).is_approved());
    }

    #[test]
    fn comparison_is_not_an_assignment() {
        let missing = validator(false).missing(&CodeSubmission::new("print(result_value == 3)"));
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains("no assignment"));
    }

    #[test]
    fn data_handle_reference_is_enforced_when_required() {
        let missing = validator(true).missing(&CodeSubmission::new("result_value = 4"));
        assert_eq!(missing, vec!["code never references the data handle `df`"]);
    }

    #[test]
    fn data_handle_must_be_a_whole_word() {
        let code = "my_df = 1\nresult_value = pd.DataFrame()";
        assert_eq!(validator(true).missing(&CodeSubmission::new(code)).len(), 1);
    }

    #[test]
    fn declared_output_requires_matching_binding() {
        let submission = CodeSubmission::new("result_value = df.shape[0]")
            .with_declared_output(DeclaredOutput::Table);
        let missing = validator(true).missing(&submission);
        assert_eq!(missing, vec!["declared a table result but never assigns `result_df`"]);
    }

    #[test]
    fn every_missing_element_is_listed() {
        let state = validator(true).review(&CodeSubmission::new("print('hello')"));
        let reason = state.revision_reason().expect("needs revision");
        assert!(reason.contains("data handle"));
        assert!(reason.contains("no assignment"));
    }

    #[test]
    fn large_inputs_are_checked_quickly() {
        let mut code = "x = 1\n".repeat(200_000);
        code.push_str("result_value = x");
        let started = std::time::Instant::now();
        assert!(validator(false).review(&CodeSubmission::new(code)).is_approved());
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }
}
