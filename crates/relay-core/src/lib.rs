//! relay-core
//!
//! In-process message flows: channels, retry, circuit breaking and
//! split/aggregate with a reaper.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, errors, state, events）
//! - **ports**: 抽象化レイヤー（MessageHandler, MessageSource, EventSink, Clock）
//! - **channel**: 名前付き FIFO チャネル（send / receive(timeout) / close）
//! - **retry**: RetryPolicy と RetryExecutor
//! - **circuit**: CircuitBreaker（Closed / Open / HalfOpen）
//! - **aggregate**: Splitter / Aggregator / CorrelationGroup
//! - **app**: 組み立て（register, configure, EndpointGroup, FlowBuilder, ReaperLoop, Poller）
//! - **impls**: EventSink の実装（tracing, チャネル, 記録用）
//! - **config**: FlowConfig（JSON + `RELAY_*` 環境変数）
//! - **observability**: 集計カウンタのビュー

pub mod aggregate;
pub mod app;
pub mod channel;
pub mod circuit;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod retry;

pub use crate::app::{GuardPolicy, configure, register};
pub use crate::channel::{Channel, ReceiveTimeout};
pub use crate::domain::{ErrorKind, FlowError, Message};
