//! EventSink port - リスナー通知の抽象化
//!
//! Retry / CircuitBreaker / Aggregator は `FlowEvent` をここに流します。
//! 実装は `impls::event_sinks` を参照。

use crate::domain::FlowEvent;

/// Receives listener events. Called inline on the emitting task, so
/// implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FlowEvent);
}

/// Plain closures work as listeners.
impl<F> EventSink for F
where
    F: Fn(FlowEvent) + Send + Sync,
{
    fn emit(&self, event: FlowEvent) {
        self(event)
    }
}
