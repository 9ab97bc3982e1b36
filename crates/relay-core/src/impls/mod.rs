//! Impls - ports の実装

pub mod event_sinks;

pub use self::event_sinks::{
    ChannelEventSink, FanoutEventSink, NoopEventSink, RecordingEventSink, TracingEventSink,
};
