//! Retry executor: runs a unit of work under a `RetryPolicy`.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{RetryPolicy, RetryState};
use crate::domain::{FlowError, RetryEvent};
use crate::impls::NoopEventSink;
use crate::ports::EventSink;

/// Wraps a unit of work with bounded retry, backoff and listener notification.
///
/// Listener protocol per `execute` call:
/// - `Open` once, before the first attempt
/// - `Error` for every failed attempt that will be retried
/// - `Close` once, with the final outcome
pub struct RetryExecutor {
    operation: String,
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
}

impl RetryExecutor {
    pub fn new(operation: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            operation: operation.into(),
            policy,
            sink: Arc::new(NoopEventSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, FlowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        self.execute_cancellable(&CancellationToken::new(), op).await
    }

    /// Same as [`RetryExecutor::execute`]; `cancel` is checked before each
    /// attempt and interrupts backoff sleeps.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, FlowError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FlowError>>,
    {
        self.sink.emit(
            RetryEvent::Open {
                operation: self.operation.clone(),
            }
            .into(),
        );

        let mut state = RetryState::new(self.policy.max_attempts);
        loop {
            if cancel.is_cancelled() {
                return Err(self.close(&state, FlowError::Cancelled));
            }

            state.start_attempt();
            let err = match op().await {
                Ok(value) => {
                    self.sink.emit(
                        RetryEvent::Close {
                            operation: self.operation.clone(),
                            attempts: state.attempt,
                            error: None,
                        }
                        .into(),
                    );
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                debug!(operation = %self.operation, attempt = state.attempt, %err, "non-retryable error");
                return Err(self.close(&state, err));
            }

            if state.is_exhausted() {
                warn!(operation = %self.operation, attempts = state.attempt, %err, "retry exhausted");
                let exhausted = FlowError::RetryExhausted {
                    attempts: state.attempt,
                    cause: Box::new(err),
                };
                return Err(self.close(&state, exhausted));
            }

            let delay = self.policy.backoff.delay_for(state.attempt);
            debug!(operation = %self.operation, attempt = state.attempt, ?delay, %err, "retrying");
            self.sink.emit(
                RetryEvent::Error {
                    operation: self.operation.clone(),
                    attempt: state.attempt,
                    error: err.clone(),
                }
                .into(),
            );
            state.record_failure(err, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    return Err(self.close(&state, FlowError::Cancelled));
                }
            }
        }
    }

    /// Emit `Close` for a failed outcome and hand the error back.
    fn close(&self, state: &RetryState, error: FlowError) -> FlowError {
        self.sink.emit(
            RetryEvent::Close {
                operation: self.operation.clone(),
                attempts: state.attempt,
                error: Some(error.clone()),
            }
            .into(),
        );
        error
    }
}
