//! Ports - 抽象化レイヤー
//!
//! コアのロジックが外部に依存する境界を trait として定義します。
//! プロトコルアダプタ（JMS, Kafka, TCP など）は `MessageSource` と
//! `Channel` の send/receive を通してフローに接続します。

pub mod clock;
pub mod event_sink;
pub mod handler;
pub mod source;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::handler::{FnHandler, MessageHandler, handler_fn};
pub use self::source::MessageSource;
