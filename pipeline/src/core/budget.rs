//! Per-request iteration budget.

/// Monotonically decrementing attempt counter owned by the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationBudget {
    max: u32,
    remaining: u32,
}

impl IterationBudget {
    pub fn new(max: u32) -> Self {
        Self { max, remaining: max }
    }

    /// Spend one attempt and return its 1-based number, or `None` when exhausted.
    pub fn try_consume(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.used())
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn used(&self) -> u32 {
        self.max - self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}
