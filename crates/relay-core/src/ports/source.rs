//! MessageSource port - ポーリングされる入力元

use async_trait::async_trait;

use crate::domain::{FlowError, Message};

/// Something a poller can ask for the next message.
///
/// `Ok(None)` means "nothing right now"; the poller simply waits for the next
/// tick.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn poll(&self) -> Result<Option<Message>, FlowError>;
}
