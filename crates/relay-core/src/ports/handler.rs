//! MessageHandler port - メッセージを処理する単位

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{FlowError, Message};

/// A handler consumes one message and produces the next one.
///
/// Handlers are shared across endpoint workers (`Arc<dyn MessageHandler>`),
/// so they take `&self` and keep any mutable state behind their own locks.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<Message, FlowError>;

    /// `handle` under a caller-owned cancellation token.
    ///
    /// Endpoints call this with their shutdown token. Handlers that wait
    /// (retry backoff, nested handlers) override it to stop waiting once the
    /// token fires; the default ignores the token.
    async fn handle_cancellable(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Message, FlowError> {
        let _ = cancel;
        self.handle(message).await
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Message, FlowError>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Message, FlowError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<Message, FlowError> {
        (self.f)(message).await
    }
}

/// Shorthand for `FnHandler::new`.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Message, FlowError>> + Send,
{
    FnHandler::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn closure_handler_transforms_payload() {
        let upper = handler_fn(|m: Message| async move {
            let s = m.payload().as_str().unwrap_or_default().to_uppercase();
            Ok(m.with_payload(json!(s)))
        });

        let out = upper.handle(Message::new(json!("hello"))).await.unwrap();
        assert_eq!(out.payload(), &json!("HELLO"));
    }

    #[tokio::test]
    async fn default_cancellable_handle_delegates_to_handle() {
        let echo = handler_fn(|m: Message| async move { Ok::<_, FlowError>(m) });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let input = Message::new(json!(1));
        let out = echo.handle_cancellable(input.clone(), &cancel).await.unwrap();
        assert_eq!(out, input);
    }
}
