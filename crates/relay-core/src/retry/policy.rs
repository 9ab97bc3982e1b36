//! Retry policy: how many attempts, which errors, and how long to wait.

use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;

use crate::domain::{ErrorKind, FlowError};

/// Delay strategy between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),

    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    /// With `jitter`, the delay is drawn uniformly from `[delay / 2, delay]`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Calculate delay after the given failed attempt.
    ///
    /// # Arguments
    /// * `attempt` - Number of attempts already made (1-indexed).
    ///
    /// Example with initial=1s, multiplier=2.0, no jitter:
    /// - attempt 1: 1s
    /// - attempt 2: 2s
    /// - attempt 3: 4s
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exp);
                let capped = Duration::try_from_secs_f64(secs).map_or(max, |d| d.min(max));
                if jitter {
                    let factor = rand::thread_rng().gen_range(0.5..=1.0);
                    capped.mul_f64(factor)
                } else {
                    capped
                }
            }
        }
    }
}

/// Retry policy for a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first one.
    pub max_attempts: u32,

    pub backoff: Backoff,

    /// Errors whose kind is in this set are retried; others propagate at once.
    pub retryable: HashSet<ErrorKind>,
}

impl RetryPolicy {
    /// Retries transient and infrastructure errors.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: HashSet::from([ErrorKind::Transient, ErrorKind::Infrastructure]),
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    pub fn exponential(max_attempts: u32, initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self::new(
            max_attempts,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
                jitter: false,
            },
        )
    }

    /// Replace the set of retryable error kinds.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    pub fn is_retryable(&self, error: &FlowError) -> bool {
        self.retryable.contains(&error.kind())
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s doubling up to 30s.
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), 2.0, Duration::from_secs(30))
    }
}
