//! Recovery advice - 成功時の通知と失敗時の代替メッセージ
//!
//! 失敗をエラーとして返さず、recovery 関数が作ったメッセージに置き換えます。
//! 成功結果は success チャネルにも複製できます。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::domain::{FlowError, Message};
use crate::ports::MessageHandler;

/// Header naming the error a recovery message stands in for.
pub const RECOVERED_ERROR_HEADER: &str = "relay_recovered_error";

/// Builds the replacement for a failed message from the input and the error.
pub type RecoverFn = Arc<dyn Fn(&Message, &FlowError) -> Message + Send + Sync>;

pub struct RecoveryAdvice {
    inner: Arc<dyn MessageHandler>,
    recover: RecoverFn,
    success: Option<Arc<Channel>>,
    failure: Option<Arc<Channel>>,
}

impl RecoveryAdvice {
    pub fn new<F>(inner: Arc<dyn MessageHandler>, recover: F) -> Self
    where
        F: Fn(&Message, &FlowError) -> Message + Send + Sync + 'static,
    {
        Self {
            inner,
            recover: Arc::new(recover),
            success: None,
            failure: None,
        }
    }

    /// Also publish a copy of every successful result here.
    pub fn with_success_channel(mut self, channel: Arc<Channel>) -> Self {
        self.success = Some(channel);
        self
    }

    /// Also publish a copy of every recovery message here.
    pub fn with_failure_channel(mut self, channel: Arc<Channel>) -> Self {
        self.failure = Some(channel);
        self
    }

    async fn publish(channel: &Option<Arc<Channel>>, message: &Message) {
        if let Some(channel) = channel {
            if let Err(err) = channel.send(message.clone()).await {
                warn!(channel = channel.name(), %err, "advice channel rejected message");
            }
        }
    }

    async fn advise(&self, message: Message, result: Result<Message, FlowError>) -> Result<Message, FlowError> {
        match result {
            Ok(out) => {
                Self::publish(&self.success, &out).await;
                Ok(out)
            }
            Err(err) => {
                debug!(message_id = %message.id(), %err, "recovering from handler failure");
                let recovered = (self.recover)(&message, &err)
                    .with_header(RECOVERED_ERROR_HEADER, err.to_string());
                Self::publish(&self.failure, &recovered).await;
                Ok(recovered)
            }
        }
    }
}

#[async_trait]
impl MessageHandler for RecoveryAdvice {
    async fn handle(&self, message: Message) -> Result<Message, FlowError> {
        let result = self.inner.handle(message.clone()).await;
        self.advise(message, result).await
    }

    async fn handle_cancellable(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<Message, FlowError> {
        let result = self.inner.handle_cancellable(message.clone(), cancel).await;
        match result {
            // shutdown is not a failure to recover from
            Err(FlowError::Cancelled) => Err(FlowError::Cancelled),
            result => self.advise(message, result).await,
        }
    }
}
