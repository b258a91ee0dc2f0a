//! Static text-pattern gate for generated code.
//!
//! Matching is a case-insensitive substring search. It over-blocks on purpose
//! (a comment mentioning `subprocess` is rejected too); the regenerator gets
//! the full list of matches so one revision can address all of them.

use crate::core::types::ReviewState;

/// Patterns blocked unless the configuration overrides them.
pub const DEFAULT_DISALLOWED_PATTERNS: &[&str] = &[
    "os.remove",
    "os.rmdir",
    "os.unlink",
    "shutil.rmtree",
    "subprocess",
    "os.system",
    "os.popen",
    "requests",
    "urllib",
    "socket",
    "http.client",
    "read_csv",
    "open(",
    "eval(",
    "exec(",
    "__import__",
];

#[derive(Debug, Clone)]
pub struct SafetyGate {
    /// `(as configured, lowercased)` pairs, deduplicated, in configuration order.
    patterns: Vec<(String, String)>,
}

impl SafetyGate {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut deduped: Vec<(String, String)> = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let lowered = pattern.to_lowercase();
            if deduped.iter().any(|(_, existing)| *existing == lowered) {
                continue;
            }
            deduped.push((pattern.to_string(), lowered));
        }
        Self { patterns: deduped }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_DISALLOWED_PATTERNS)
    }

    /// Every configured pattern found in `code`.
    pub fn violations(&self, code: &str) -> Vec<&str> {
        let lowered = code.to_lowercase();
        self.patterns
            .iter()
            .filter(|(_, needle)| lowered.contains(needle.as_str()))
            .map(|(pattern, _)| pattern.as_str())
            .collect()
    }

    pub fn review(&self, code: &str) -> ReviewState {
        let violations = self.violations(code);
        if violations.is_empty() {
            return ReviewState::Approved;
        }
        ReviewState::NeedsRevision(format!(
            "code contains disallowed operations: {}",
            violations.join(", ")
        ))
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::with_defaults()
    }
}
