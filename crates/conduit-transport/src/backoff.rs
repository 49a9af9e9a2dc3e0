//! Exponential backoff for tunnel reconnection.

use rand::Rng;
use std::time::Duration;

/// Reconnect behaviour after the tunnel drops unexpectedly.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum consecutive failed attempts before giving up (0 = never reconnect).
    pub max_retries: u32,
    /// Delay before the first attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// The schedule for one outage: `max_retries` delays, one per attempt.
    pub fn delays(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            attempt: 0,
        }
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    ///
    /// `initial_delay_ms * backoff_factor^attempt` with ±25% jitter, never
    /// above `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let growth = self.backoff_factor.powi(exponent);
        let nominal_ms = (self.initial_delay_ms as f64 * growth)
            .max(0.0)
            .min(self.max_delay_ms as f64);
        jittered(Duration::from_secs_f64(nominal_ms / 1000.0)).min(cap)
    }
}

/// Iterator over the reconnect delays of a [`ReconnectPolicy`].
///
/// Yields `(attempt, delay)` with `attempt` counted from 1, and ends once the
/// policy's retries are used up.
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: &'a ReconnectPolicy,
    attempt: u32,
}

impl Iterator for Backoff<'_> {
    type Item = (u32, Duration);

    fn next(&mut self) -> Option<Self::Item> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay(self.attempt);
        self.attempt += 1;
        Some((self.attempt, delay))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.policy.max_retries - self.attempt) as usize;
        (left, Some(left))
    }
}

/// Spread `nominal` uniformly over ±25% so clients do not reconnect in lockstep.
fn jittered(nominal: Duration) -> Duration {
    nominal.mul_f64(rand::rng().random_range(0.75..=1.25))
}
