//! Retry/dead-letter policy.
//!
//! `decide` is a pure function of its inputs; only `RetryPolicy::backoff`
//! draws randomness (the jitter), and it does so on top of a deterministic
//! capped exponential delay.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a handler failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// May succeed on a later attempt (timeouts, unavailable dependencies, cancellation).
    Transient,
    /// Will never succeed (malformed payload, business rule rejection).
    Permanent,
}

/// Outcome of the retry decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Retry,
    DeadLetter,
}

/// Decide whether a failed attempt is retried or dead-lettered.
///
/// `attempt` is 1-indexed (the delivery that just failed).
pub fn decide(attempt: u32, classification: FailureClass, max_attempts: u32) -> Decision {
    match classification {
        FailureClass::Transient if attempt < max_attempts => Decision::Retry,
        _ => Decision::DeadLetter,
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Deliveries allowed before a transient failure is dead-lettered (>= 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_backoff: Duration,
    /// Cap for the exponential part of the delay
    pub max_backoff: Duration,
    /// Add a random delay in `[0, base_backoff]` to spread out retry storms
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
            jitter: true,
        }
    }

    /// Same policy without jitter (fully deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn decide(&self, attempt: u32, classification: FailureClass) -> Decision {
        decide(attempt, classification, self.max_attempts)
    }

    /// `base * 2^(attempt-1)`, capped at `max_backoff`.
    pub fn capped_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Capped backoff plus an explicit jitter, clamped to `[0, base_backoff]`.
    pub fn backoff_with_jitter(&self, attempt: u32, jitter: Duration) -> Duration {
        self.capped_backoff(attempt)
            .saturating_add(jitter.min(self.base_backoff))
    }

    /// Delay before redelivering after failed `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter {
            random_jitter(self.base_backoff)
        } else {
            Duration::ZERO
        };
        self.backoff_with_jitter(attempt, jitter)
    }
}

fn random_jitter(bound: Duration) -> Duration {
    let bound_nanos = u64::try_from(bound.as_nanos()).unwrap_or(u64::MAX);
    if bound_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::thread_rng().gen_range(0..=bound_nanos))
}
