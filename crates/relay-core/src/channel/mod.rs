//! Channel: named, in-process FIFO conduit between flow stages.
//!
//! Design:
//! - State (buffer + closed flag) lives behind one `tokio::sync::Mutex`.
//! - `readable` / `writable` are `Notify`s; waiters register *before* checking
//!   state so a send or close that races with the check is never missed.
//! - The lock is never held across an await other than the lock itself.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{FlowError, Message};

/// How long `receive` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveTimeout {
    /// Non-blocking: return `Timeout` if nothing is buffered.
    Immediate,
    After(Duration),
    Forever,
}

impl From<Duration> for ReceiveTimeout {
    fn from(d: Duration) -> Self {
        if d.is_zero() {
            ReceiveTimeout::Immediate
        } else {
            ReceiveTimeout::After(d)
        }
    }
}

impl From<Option<Duration>> for ReceiveTimeout {
    /// `None` blocks indefinitely.
    fn from(d: Option<Duration>) -> Self {
        d.map_or(ReceiveTimeout::Forever, ReceiveTimeout::from)
    }
}

impl ReceiveTimeout {
    fn elapsed_error(self) -> FlowError {
        match self {
            ReceiveTimeout::After(d) => FlowError::Timeout(d),
            ReceiveTimeout::Immediate | ReceiveTimeout::Forever => FlowError::Timeout(Duration::ZERO),
        }
    }
}

struct ChannelState {
    buffer: VecDeque<Message>,
    closed: bool,
}

/// An addressable conduit. Share it as `Arc<Channel>`.
pub struct Channel {
    name: String,
    capacity: Option<usize>,
    state: Mutex<ChannelState>,
    readable: Notify,
    writable: Notify,
}

impl Channel {
    /// Unbounded channel.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, None)
    }

    /// Channel holding at most `capacity` messages; `send` waits for room.
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_capacity(name, Some(capacity.max(1)))
    }

    fn with_capacity(name: impl Into<String>, capacity: Option<usize>) -> Self {
        Self {
            name: name.into(),
            capacity,
            state: Mutex::new(ChannelState {
                buffer: VecDeque::new(),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn closed_error(&self) -> FlowError {
        FlowError::ChannelClosed(self.name.clone())
    }

    fn is_full(&self, state: &ChannelState) -> bool {
        self.capacity.is_some_and(|cap| state.buffer.len() >= cap)
    }

    /// Send a message, waiting for room on a full bounded channel.
    pub async fn send(&self, message: Message) -> Result<(), FlowError> {
        loop {
            let room = self.writable.notified();
            tokio::pin!(room);
            room.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(self.closed_error());
                }
                if !self.is_full(&state) {
                    state.buffer.push_back(message);
                    drop(state);
                    self.readable.notify_one();
                    return Ok(());
                }
            }

            room.await;
        }
    }

    /// Send without waiting; fails with `ChannelFull` on a full bounded channel.
    pub async fn try_send(&self, message: Message) -> Result<(), FlowError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.closed_error());
        }
        if self.is_full(&state) {
            return Err(FlowError::ChannelFull(self.name.clone()));
        }
        state.buffer.push_back(message);
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Receive the next message.
    ///
    /// Buffered messages are still delivered after `close()`; once drained the
    /// channel reports `ChannelClosed`.
    pub async fn receive(&self, timeout: impl Into<ReceiveTimeout>) -> Result<Message, FlowError> {
        self.receive_inner(timeout.into(), None).await
    }

    /// Like [`Channel::receive`], but gives up with `Cancelled` as soon as
    /// `cancel` fires (checked before blocking and while waiting).
    pub async fn receive_cancellable(
        &self,
        timeout: impl Into<ReceiveTimeout>,
        cancel: &CancellationToken,
    ) -> Result<Message, FlowError> {
        self.receive_inner(timeout.into(), Some(cancel)).await
    }

    async fn receive_inner(
        &self,
        timeout: ReceiveTimeout,
        cancel: Option<&CancellationToken>,
    ) -> Result<Message, FlowError> {
        let deadline = match timeout {
            ReceiveTimeout::After(d) => Some(Instant::now() + d),
            ReceiveTimeout::Immediate | ReceiveTimeout::Forever => None,
        };

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(FlowError::Cancelled);
            }

            let ready = self.readable.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(message) = state.buffer.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Ok(message);
                }
                if state.closed {
                    return Err(self.closed_error());
                }
            }

            if timeout == ReceiveTimeout::Immediate {
                return Err(timeout.elapsed_error());
            }

            let cancelled = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            let expired = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = &mut ready => {}
                _ = expired => return Err(timeout.elapsed_error()),
                _ = cancelled => return Err(FlowError::Cancelled),
            }
        }
    }

    /// Close the channel. Further sends fail; blocked receivers wake up.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        let pending = state.buffer.len();
        drop(state);

        debug!(channel = %self.name, pending, "channel closed");
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn send_then_immediate_receive_is_identity() {
        let ch = Channel::new("in");
        let m = Message::new(json!({"order": 42})).with_header("source", "test");

        ch.send(m.clone()).await.unwrap();
        let got = ch.receive(ReceiveTimeout::Immediate).await.unwrap();

        assert_eq!(got, m);
    }

    #[tokio::test]
    async fn fifo_order_for_single_producer() {
        let ch = Channel::new("in");
        for i in 0..5 {
            ch.send(Message::new(json!(i))).await.unwrap();
        }
        for i in 0..5 {
            let m = ch.receive(Duration::ZERO).await.unwrap();
            assert_eq!(m.payload(), &json!(i));
        }
    }

    #[tokio::test]
    async fn immediate_receive_on_empty_times_out() {
        let ch = Channel::new("in");
        let err = ch.receive(ReceiveTimeout::Immediate).await.unwrap_err();
        assert_eq!(err, FlowError::Timeout(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_times_out() {
        let ch = Channel::new("in");
        let start = Instant::now();
        let err = ch
            .receive(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::Timeout(Duration::from_millis(500)));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn send_wakes_blocked_receiver() {
        let ch = Arc::new(Channel::new("in"));
        let rx = tokio::spawn({
            let ch = Arc::clone(&ch);
            async move { ch.receive(ReceiveTimeout::Forever).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        ch.send(Message::new(json!("late"))).await.unwrap();

        let got = rx.await.unwrap().unwrap();
        assert_eq!(got.payload(), &json!("late"));
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let ch = Channel::new("out");
        ch.close().await;
        let err = ch.send(Message::new(json!(1))).await.unwrap_err();
        assert_eq!(err, FlowError::ChannelClosed("out".into()));
    }

    #[tokio::test]
    async fn close_drains_buffer_before_reporting_closed() {
        let ch = Channel::new("out");
        ch.send(Message::new(json!(1))).await.unwrap();
        ch.close().await;

        assert!(ch.receive(ReceiveTimeout::Forever).await.is_ok());
        let err = ch.receive(ReceiveTimeout::Forever).await.unwrap_err();
        assert!(matches!(err, FlowError::ChannelClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_blocked_receiver() {
        let ch = Arc::new(Channel::new("out"));
        let rx = tokio::spawn({
            let ch = Arc::clone(&ch);
            async move { ch.receive(ReceiveTimeout::Forever).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.close().await;

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, FlowError::ChannelClosed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_blocking_receive() {
        let ch = Arc::new(Channel::new("in"));
        let token = CancellationToken::new();
        let rx = tokio::spawn({
            let ch = Arc::clone(&ch);
            let token = token.clone();
            async move { ch.receive_cancellable(ReceiveTimeout::Forever, &token).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert_eq!(rx.await.unwrap().unwrap_err(), FlowError::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_token_is_checked_before_receive() {
        let ch = Channel::new("in");
        ch.send(Message::new(json!(1))).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let err = ch
            .receive_cancellable(ReceiveTimeout::Immediate, &token)
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::Cancelled);
        assert_eq!(ch.len().await, 1);
    }

    #[tokio::test]
    async fn try_send_on_full_bounded_channel_fails() {
        let ch = Channel::bounded("small", 1);
        ch.try_send(Message::new(json!(1))).await.unwrap();
        let err = ch.try_send(Message::new(json!(2))).await.unwrap_err();
        assert_eq!(err, FlowError::ChannelFull("small".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_send_waits_for_room() {
        let ch = Arc::new(Channel::bounded("small", 1));
        ch.send(Message::new(json!(1))).await.unwrap();

        let tx = tokio::spawn({
            let ch = Arc::clone(&ch);
            async move { ch.send(Message::new(json!(2))).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!tx.is_finished());

        let first = ch.receive(ReceiveTimeout::Immediate).await.unwrap();
        assert_eq!(first.payload(), &json!(1));

        tx.await.unwrap().unwrap();
        let second = ch.receive(ReceiveTimeout::Immediate).await.unwrap();
        assert_eq!(second.payload(), &json!(2));
    }
}
