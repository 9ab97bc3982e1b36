//! EventSink 実装
//!
//! - **NoopEventSink**: 何もしない（デフォルト）
//! - **TracingEventSink**: tracing に構造化ログとして出す
//! - **ChannelEventSink**: tokio mpsc に流す（別タスクで購読する用）
//! - **RecordingEventSink**: メモリに貯める（テスト・デモ用）

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{CircuitEvent, FlowEvent, GroupEvent, RetryEvent};
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: FlowEvent) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: FlowEvent) {
        match event {
            FlowEvent::Retry(RetryEvent::Open { operation }) => {
                debug!(%operation, "retry open");
            }
            FlowEvent::Retry(RetryEvent::Error {
                operation,
                attempt,
                error,
            }) => {
                warn!(%operation, attempt, %error, "retry attempt failed");
            }
            FlowEvent::Retry(RetryEvent::Close {
                operation,
                attempts,
                error,
            }) => match error {
                None => debug!(%operation, attempts, "retry close: success"),
                Some(error) => warn!(%operation, attempts, %error, "retry close: failure"),
            },
            FlowEvent::Circuit(CircuitEvent::Transition { breaker, from, to }) => {
                info!(%breaker, ?from, ?to, "circuit transition");
            }
            FlowEvent::Circuit(CircuitEvent::Rejected { breaker }) => {
                debug!(%breaker, "circuit rejected call");
            }
            FlowEvent::Group(GroupEvent::Released {
                correlation_id,
                size,
            }) => {
                debug!(%correlation_id, size, "group released");
            }
            FlowEvent::Group(GroupEvent::Expired {
                correlation_id,
                received,
                expected,
                partial_emitted,
            }) => {
                warn!(%correlation_id, received, expected, partial_emitted, "group expired");
            }
            FlowEvent::Group(GroupEvent::LateDiscarded {
                correlation_id,
                sequence_number,
            }) => {
                warn!(%correlation_id, sequence_number, "late part discarded");
            }
        }
    }
}

/// Forwards events to an unbounded mpsc so emitters never wait on a slow
/// listener.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FlowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: FlowEvent) {
        // ignore send error: the listener may already be gone
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<FlowEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FlowEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn retry_events(&self) -> Vec<RetryEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::Retry(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn circuit_events(&self) -> Vec<CircuitEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::Circuit(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn group_events(&self) -> Vec<GroupEvent> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                FlowEvent::Group(g) => Some(g),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: FlowEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Sends every event to each inner sink in order.
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: FlowEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
