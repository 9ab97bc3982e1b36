//! Circuit breaker: Closed / Open / HalfOpen gate over a downstream call.

mod breaker;
mod state;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
