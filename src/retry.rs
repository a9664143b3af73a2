//! Retry budgets and backoff schedules shared by every retrying component.
//!
//! The selector resolver waits a fixed delay between attempts, storage
//! transfers back off linearly, and webhook delivery and status-store
//! connection back off exponentially. All three are expressed as a
//! [`RetryPolicy`] so attempt counting is done the same way everywhere.

use std::time::Duration;

/// How long to wait after a failed attempt before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay after every attempt.
    Fixed(Duration),
    /// `step * attempt`.
    Linear(Duration),
    /// `unit * base^attempt`.
    Exponential { unit: Duration, base: u32 },
}

impl Backoff {
    /// Delay to wait after the given (1-based) attempt failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear(step) => step.saturating_mul(attempt),
            Backoff::Exponential { unit, base } => unit.saturating_mul(base.saturating_pow(attempt)),
        }
    }
}

/// An attempt budget plus the backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Never zero.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}
