//! ReaperLoop - 期限切れ correlation group の定期回収

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::Aggregator;

/// ReaperLoop は一定間隔で `Aggregator::reap_expired` を呼ぶ
///
/// # フロー
/// 1. interval の tick を待つ
/// 2. deadline を過ぎた group を store から外す（aggregator と同じ lock の中）
/// 3. ExpiryPolicy に従って partial を流すか捨てる
pub struct ReaperLoop {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Shortest sweep interval; shorter requests (including zero) are raised to it.
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

impl ReaperLoop {
    pub fn spawn(aggregator: Arc<Aggregator>, interval: Duration) -> Self {
        if interval < MIN_REAP_INTERVAL {
            warn!(requested = ?interval, used = ?MIN_REAP_INTERVAL, "reaper interval too short, clamping");
        }
        let interval = interval.max(MIN_REAP_INTERVAL);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(?interval, "reaper started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = aggregator.reap_expired().await;
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "reaped expired groups");
                        }
                    }
                }
            }
            debug!("reaper stopped");
        });

        Self { cancel, join }
    }

    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            error!(%err, "reaper task failed");
        }
    }
}
