//! Stable exit codes for pipeline CLI commands.

/// Command succeeded (`run` produced a success outcome, `check` approved the code).
pub const OK: i32 = 0;
/// Invalid input, config, or an infrastructure failure.
pub const INVALID: i32 = 1;
/// `insight-pipeline run` finished with an error outcome.
pub const FAILED: i32 = 2;
/// `insight-pipeline check` rejected the code.
pub const REJECTED: i32 = 3;
