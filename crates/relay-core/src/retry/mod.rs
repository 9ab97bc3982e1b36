//! Retry module: policy, per-call state and the executor.

mod executor;
mod policy;
mod state;

pub use executor::RetryExecutor;
pub use policy::{Backoff, RetryPolicy};
pub use state::RetryState;
