//! Reconnect bookkeeping shared by `connect()` and the monitoring loop.

use std::time::{Duration, Instant};

use crate::resilience::ExponentialBackoff;

/// Retry progress since the last successful connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionRetryState {
    /// Failed attempts since the last success
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    /// Earliest instant the next attempt may start
    pub next_eligible: Option<Instant>,
}

impl ConnectionRetryState {
    /// Record a failed attempt at `now` that must be followed by `delay`
    pub fn record_failure(&mut self, now: Instant, delay: Duration) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt = Some(now);
        self.next_eligible = Some(now + delay);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.attempts >= max_attempts
    }

    /// Time left before the next attempt is due
    pub fn wait_time(&self, now: Instant) -> Duration {
        self.next_eligible
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    /// Renew an exhausted budget once `idle` has passed without attempts
    ///
    /// Returns `true` if the budget was renewed.
    pub fn renew_if_idle(&mut self, now: Instant, max_attempts: u32, idle: Duration) -> bool {
        if self.is_exhausted(max_attempts) && ExponentialBackoff::is_due(now, self.last_attempt, idle) {
            self.reset();
            return true;
        }
        false
    }
}
