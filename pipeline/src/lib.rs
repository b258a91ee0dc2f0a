//! Bounded retry execution pipeline for generated data-analysis code.
//!
//! A submission is gated, executed against a read-only data handle inside a
//! time-boxed sandbox, normalized, and either returned or fed back to a
//! regenerator for another attempt. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (path confinement, static gates,
//!   normalization, outcomes). No I/O, fully testable in isolation.
//! - **[`io`]** and **[`sandbox`]**: Side-effecting operations (config files,
//!   child processes, script engines). Behind traits so tests can script them.
//!
//! [`controller`] sequences the two into the per-request state machine.

pub mod cancel;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod sandbox;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use controller::{run_pipeline, run_pipeline_with_token};
