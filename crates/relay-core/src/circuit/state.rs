//! Mutable breaker state. Only `CircuitBreaker` touches it, under its mutex.

use std::time::Duration;

use tokio::time::Instant;

use crate::domain::CircuitState;

#[derive(Debug, Clone)]
pub(crate) struct BreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
}

impl BreakerState {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }

    pub fn reset_elapsed(&self, now: Instant, reset_timeout: Duration) -> bool {
        self.opened_at
            .is_none_or(|at| now.saturating_duration_since(at) >= reset_timeout)
    }

    pub fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }

    /// Open -> HalfOpen. `opened_at` is kept so an abandoned trial can hand
    /// the gate straight to the next caller.
    pub fn begin_trial(&mut self) {
        self.state = CircuitState::HalfOpen;
    }

    pub fn abandon_trial(&mut self) {
        self.state = CircuitState::Open;
    }

    pub fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }
}
