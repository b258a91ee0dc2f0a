//! Retry feedback prompt rendered for an external code regenerator.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::outcome::Failure;
use crate::core::types::{CodeSubmission, DataContext};

const FEEDBACK_TEMPLATE: &str = include_str!("prompts/feedback.md");

#[derive(Debug, Clone, Serialize)]
struct ColumnContext<'a> {
    name: &'a str,
    dtype: Option<&'a str>,
}

/// Inputs for one feedback prompt.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackInputs<'a> {
    /// Iteration that produced `failure` (1-based).
    pub iteration: u32,
    pub previous: &'a CodeSubmission,
    pub failure: &'a Failure,
    pub data: &'a DataContext,
    pub data_handle: &'a str,
}

/// Render the feedback prompt handed to the regenerator on stdin.
pub fn render_feedback(input: &FeedbackInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("feedback", FEEDBACK_TEMPLATE)
        .context("load feedback template")?;
    let columns: Vec<ColumnContext<'_>> = input
        .data
        .schema
        .iter()
        .flat_map(|schema| {
            schema.columns.iter().map(|name| ColumnContext {
                name,
                dtype: schema.dtypes.get(name).map(String::as_str),
            })
        })
        .collect();
    let template = env.get_template("feedback")?;
    let rendered = template
        .render(context! {
            iteration => input.iteration,
            error_type => input.failure.kind.as_str(),
            error_message => input.failure.detail().trim(),
            previous_code => input.previous.text.trim(),
            data_handle => input.data_handle,
            columns => columns,
        })
        .context("render feedback prompt")?;
    Ok(rendered)
}
