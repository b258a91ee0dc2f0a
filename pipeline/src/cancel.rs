//! Cooperative cancellation and wall-clock deadlines for blocking stages.
//!
//! A [`CancelToken`] is shared between the caller and a running request. A
//! [`CancelScope`] pairs the token with an optional deadline; every blocking
//! wait (child processes, the embedded engine) polls the scope instead of
//! relying on OS signals.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Caller-held switch that aborts an in-flight request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why a scoped wait stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Cancelled => "cancelled",
            StopReason::TimedOut => "timed_out",
        }
    }
}

/// A cancel token plus the deadline of one blocking stage.
#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancelToken,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl CancelScope {
    /// Start a scope now; the deadline is `timeout` from this instant.
    pub fn new(token: &CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            token: token.clone(),
            timeout,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
        }
    }

    /// Scope with cancellation only.
    pub fn unbounded(token: &CancelToken) -> Self {
        Self::new(token, None)
    }

    /// Cancellation takes precedence over an expired deadline.
    pub fn check(&self) -> Option<StopReason> {
        if self.token.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimedOut),
            _ => None,
        }
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_scope_does_not_stop() {
        let scope = CancelScope::new(&CancelToken::new(), Some(Duration::from_secs(30)));
        assert_eq!(scope.check(), None);
        assert!(scope.remaining().expect("bounded") > Duration::from_secs(29));
    }

    #[test]
    fn expired_deadline_times_out() {
        let scope = CancelScope::new(&CancelToken::new(), Some(Duration::ZERO));
        assert_eq!(scope.check(), Some(StopReason::TimedOut));
        assert_eq!(scope.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn cancellation_wins_over_timeout() {
        let token = CancelToken::new();
        let scope = CancelScope::new(&token, Some(Duration::ZERO));
        token.cancel();
        assert_eq!(scope.check(), Some(StopReason::Cancelled));
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let scope = CancelScope::unbounded(&token);
        token.clone().cancel();
        assert!(scope.token().is_cancelled());
        assert_eq!(scope.remaining(), None);
    }
}
