//! Poller - 入力元を一定間隔でポーリングしてチャネルに流す
//!
//! 間隔は実行中に `set_interval` で変更でき、次の tick から反映されます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::domain::FlowError;
use crate::ports::MessageSource;

pub struct Poller {
    interval_tx: watch::Sender<Duration>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl Poller {
    /// Start polling `source` every `interval`, sending each message to `output`.
    ///
    /// The poller stops on shutdown or once `output` is closed.
    pub fn spawn(source: Arc<dyn MessageSource>, output: Arc<Channel>, interval: Duration) -> Self {
        let (interval_tx, interval_rx) = watch::channel(interval);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            poll_loop(source, output, interval_rx, token).await;
        });

        Self {
            interval_tx,
            cancel,
            join,
        }
    }

    /// Takes effect after the sleep currently in progress.
    pub fn set_interval(&self, interval: Duration) {
        info!(?interval, "poller interval changed");
        self.interval_tx.send_replace(interval);
    }

    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    pub async fn shutdown_and_join(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            error!(%err, "poller task failed");
        }
    }
}

async fn poll_loop(
    source: Arc<dyn MessageSource>,
    output: Arc<Channel>,
    interval_rx: watch::Receiver<Duration>,
    cancel: CancellationToken,
) {
    loop {
        let delay = *interval_rx.borrow();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match source.poll().await {
            Ok(Some(message)) => match output.send(message).await {
                Ok(()) => {}
                Err(FlowError::ChannelClosed(_)) => {
                    info!(channel = output.name(), "poller output closed, stopping");
                    break;
                }
                Err(err) => warn!(channel = output.name(), %err, "poller send failed"),
            },
            Ok(None) => debug!("poll returned nothing"),
            Err(err) => warn!(%err, "poll failed"),
        }
    }
}
