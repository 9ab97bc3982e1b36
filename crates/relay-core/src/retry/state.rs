//! Per-invocation retry bookkeeping.

use std::time::Duration;

use crate::domain::FlowError;

/// Created for each `execute` call and dropped on success or exhaustion.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Attempts started so far (1-indexed once running).
    pub attempt: u32,

    pub max_attempts: u32,

    /// Delay chosen before the next attempt.
    pub backoff: Duration,

    pub last_error: Option<FlowError>,
}

impl RetryState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            backoff: Duration::ZERO,
            last_error: None,
        }
    }

    pub fn start_attempt(&mut self) {
        self.attempt += 1;
    }

    pub fn record_failure(&mut self, error: FlowError, backoff: Duration) {
        self.last_error = Some(error);
        self.backoff = backoff;
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}
