//! Events - リスナーに通知されるイベント
//!
//! オープンな observer 階層ではなく、閉じた enum として定義します。
//! 配送は `ports::EventSink` 経由（直接呼び出し or チャネル）。

use super::errors::FlowError;
use super::ids::CorrelationId;
use super::state::CircuitState;

/// Retry executor lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryEvent {
    /// Before the first attempt.
    Open { operation: String },

    /// A failed attempt that will be retried.
    Error {
        operation: String,
        attempt: u32,
        error: FlowError,
    },

    /// Final outcome. `error` is `None` on success.
    Close {
        operation: String,
        attempts: u32,
        error: Option<FlowError>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    Transition {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },
    Rejected { breaker: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    Released {
        correlation_id: CorrelationId,
        size: u32,
    },
    Expired {
        correlation_id: CorrelationId,
        received: u32,
        expected: u32,
        partial_emitted: bool,
    },
    LateDiscarded {
        correlation_id: CorrelationId,
        sequence_number: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Retry(RetryEvent),
    Circuit(CircuitEvent),
    Group(GroupEvent),
}

impl From<RetryEvent> for FlowEvent {
    fn from(e: RetryEvent) -> Self {
        FlowEvent::Retry(e)
    }
}

impl From<CircuitEvent> for FlowEvent {
    fn from(e: CircuitEvent) -> Self {
        FlowEvent::Circuit(e)
    }
}

impl From<GroupEvent> for FlowEvent {
    fn from(e: GroupEvent) -> Self {
        FlowEvent::Group(e)
    }
}
