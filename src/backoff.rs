//! Exponential backoff for retrying transient transmission failures.

use std::time::Duration;

/// Exponential backoff state for one retry sequence.
///
/// Each call to [`next_wait`](Self::next_wait) returns the current delay and
/// doubles it, capped at the maximum. [`reset`](Self::reset) after a success
/// starts over from the initial delay. There is no retry budget: transient
/// failures are retried indefinitely.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    /// Next delay; increments the failure counter.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        wait
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a failure has been recorded since the last reset.
    pub fn is_armed(&self) -> bool {
        self.attempts > 0
    }
}
