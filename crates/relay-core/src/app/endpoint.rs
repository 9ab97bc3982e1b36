//! Endpoint - チャネルとハンドラをつなぐ受信ループ
//!
//! receive → handle → send を繰り返します。失敗は error チャネルへ
//! エラーメッセージとして流し、捨てません。

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ReceiveTimeout};
use crate::domain::{FlowError, Message};
use crate::ports::MessageHandler;

/// Header on an error message: id of the message whose handling failed.
pub const FAILED_MESSAGE_HEADER: &str = "relay_failed_message_id";

/// Wiring for one handler stage.
#[derive(Clone)]
pub struct Endpoint {
    pub name: String,
    pub input: Arc<Channel>,
    pub handler: Arc<dyn MessageHandler>,

    /// Where results go. `None` makes this a one-way endpoint.
    pub output: Option<Arc<Channel>>,

    pub errors: Option<Arc<Channel>>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, input: Arc<Channel>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: name.into(),
            input,
            handler,
            output: None,
            errors: None,
        }
    }

    pub fn to(mut self, output: Arc<Channel>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn errors_to(mut self, errors: Arc<Channel>) -> Self {
        self.errors = Some(errors);
        self
    }
}

/// Endpoint worker group handle.
/// - `request_shutdown()` で全ワーカーを止める（処理中のメッセージは最後まで処理）
/// - 入力チャネルが close されて空になっても止まる
pub struct EndpointGroup {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl EndpointGroup {
    /// Spawn `n` workers reading from the same input channel.
    pub fn spawn(n: usize, endpoint: Endpoint) -> Self {
        let cancel = CancellationToken::new();
        let endpoint = Arc::new(endpoint);

        let joins = (0..n.max(1))
            .map(|worker_id| {
                let ep = Arc::clone(&endpoint);
                let token = cancel.clone();
                tokio::spawn(async move { endpoint_loop(worker_id, ep, token).await })
            })
            .collect();

        Self { cancel, joins }
    }

    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the workers to stop on their own (input closed and drained).
    pub async fn join(self) {
        for j in self.joins {
            let _ = j.await;
        }
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        self.join().await;
    }
}

async fn endpoint_loop(worker_id: usize, ep: Arc<Endpoint>, cancel: CancellationToken) {
    debug!(endpoint = %ep.name, worker_id, "endpoint worker started");
    loop {
        let message = match ep.input.receive_cancellable(ReceiveTimeout::Forever, &cancel).await {
            Ok(message) => message,
            Err(FlowError::Cancelled) => break,
            Err(FlowError::ChannelClosed(_)) => {
                info!(endpoint = %ep.name, worker_id, "input closed, stopping");
                break;
            }
            Err(err) => {
                warn!(endpoint = %ep.name, worker_id, %err, "receive failed");
                continue;
            }
        };

        let failed = message.clone();
        let result = match ep.handler.handle_cancellable(message, &cancel).await {
            Ok(out) => match &ep.output {
                Some(output) => output.send(out).await,
                None => {
                    debug!(endpoint = %ep.name, message_id = %out.id(), "one-way endpoint, result dropped");
                    Ok(())
                }
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {}
            Err(FlowError::Cancelled) => {
                info!(endpoint = %ep.name, worker_id, message_id = %failed.id(), "handling cancelled by shutdown");
                report_failure(&ep, worker_id, failed, FlowError::Cancelled).await;
                break;
            }
            Err(err) => report_failure(&ep, worker_id, failed, err).await,
        }
    }
    debug!(endpoint = %ep.name, worker_id, "endpoint worker stopped");
}

async fn report_failure(ep: &Endpoint, worker_id: usize, failed: Message, err: FlowError) {
    warn!(
        endpoint = %ep.name,
        worker_id,
        message_id = %failed.id(),
        kind = ?err.kind(),
        %err,
        "handling failed"
    );

    let Some(errors) = &ep.errors else {
        return;
    };
    let error_message = error_message(&ep.name, &failed, &err);
    if let Err(send_err) = errors.send(error_message).await {
        warn!(endpoint = %ep.name, %send_err, "error channel rejected error message");
    }
}

/// Error message payload: `{ endpoint, error, kind, failed_message }`.
pub fn error_message(endpoint: &str, failed: &Message, err: &FlowError) -> Message {
    let failed_json = serde_json::to_value(failed).unwrap_or_default();
    Message::new(json!({
        "endpoint": endpoint,
        "error": err.to_string(),
        "kind": err.kind(),
        "failed_message": failed_json,
    }))
    .with_headers(failed.headers())
    .with_header(FAILED_MESSAGE_HEADER, failed.id().to_string())
}
