//! Guarded handler - retry / circuit breaker で包んだ処理単位

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::domain::{FlowError, Message};
use crate::ports::{EventSink, MessageHandler};
use crate::retry::{RetryExecutor, RetryPolicy};

/// Which protections to put around a unit of work.
#[derive(Debug, Clone, Default)]
pub struct GuardPolicy {
    /// Operation / breaker name used in events and logs.
    pub name: String,

    pub retry: Option<RetryPolicy>,

    pub breaker: Option<CircuitBreakerConfig>,
}

impl GuardPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: None,
            breaker: None,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }
}

/// A handler wrapped in retry (outer) and circuit breaker (inner).
///
/// Every retry attempt goes through the breaker, so attempts made while the
/// circuit is Open fail fast with `CircuitOpen`, which is transient and
/// therefore retried after backoff.
pub struct GuardedHandler {
    name: String,
    inner: Arc<dyn MessageHandler>,
    retry: Option<RetryExecutor>,
    breaker: Option<Arc<CircuitBreaker>>,
}

/// Wrap `unit_of_work` according to `policy`, reporting lifecycle events to
/// `listener`.
pub fn register(
    unit_of_work: Arc<dyn MessageHandler>,
    policy: GuardPolicy,
    listener: Arc<dyn EventSink>,
) -> GuardedHandler {
    let retry = policy
        .retry
        .map(|p| RetryExecutor::new(policy.name.clone(), p).with_sink(Arc::clone(&listener)));
    let breaker = policy.breaker.map(|c| {
        Arc::new(CircuitBreaker::new(policy.name.clone(), c).with_sink(Arc::clone(&listener)))
    });

    GuardedHandler {
        name: policy.name,
        inner: unit_of_work,
        retry,
        breaker,
    }
}

impl GuardedHandler {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker, when the policy asked for one.
    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    async fn attempt(&self, message: Message, cancel: &CancellationToken) -> Result<Message, FlowError> {
        match &self.breaker {
            Some(breaker) => {
                breaker
                    .call(|| self.inner.handle_cancellable(message, cancel))
                    .await
            }
            None => self.inner.handle_cancellable(message, cancel).await,
        }
    }
}

#[async_trait]
impl MessageHandler for GuardedHandler {
    async fn handle(&self, message: Message) -> Result<Message, FlowError> {
        self.handle_cancellable(message, &CancellationToken::new()).await
    }

    /// Retry checks `cancel` before every attempt and while sleeping between
    /// attempts; an in-flight attempt is left to finish.
    async fn handle_cancellable(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Message, FlowError> {
        match &self.retry {
            Some(retry) => {
                retry
                    .execute_cancellable(cancel, || self.attempt(message.clone(), cancel))
                    .await
            }
            None => self.attempt(message, cancel).await,
        }
    }
}

impl std::fmt::Debug for GuardedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedHandler")
            .field("name", &self.name)
            .field("retry", &self.retry.as_ref().map(RetryExecutor::policy))
            .field("breaker", &self.breaker.as_ref().map(|b| b.snapshot()))
            .finish()
    }
}
