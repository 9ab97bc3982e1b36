//! Aggregate - 分割・相関・回収
//!
//! - **Splitter**: 1 メッセージを順序付きのパートに分割
//! - **Aggregator**: correlation id ごとにパートを集め、揃ったら 1 メッセージに結合
//! - 期限切れグループの回収は `Aggregator::reap_expired`（定期実行は `app::ReaperLoop`）

pub mod aggregator;
pub mod group;
pub mod splitter;

pub use self::aggregator::{
    AddOutcome, Aggregator, AggregatorConfig, CORRELATION_HEADER, CombineFn, DISCARD_REASON_HEADER,
    ExpiryPolicy, PARTIAL_HEADER, collect_payloads,
};
pub use self::group::CorrelationGroup;
pub use self::splitter::{SplitFn, Splitter};
