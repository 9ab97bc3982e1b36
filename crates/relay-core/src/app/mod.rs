//! App - アプリケーション層
//!
//! コンポーネントを組み合わせてフローを組み立てます。
//!
//! # 主要コンポーネント
//! - **register**: handler を retry / circuit breaker で包む
//! - **configure**: splitter / aggregator / reaper の組み立て
//! - **EndpointGroup**: 受信ループ（receive→handle→send、失敗は error チャネルへ）
//! - **FlowBuilder**: 名前付きフローの構築と起動時検証
//! - **ReaperLoop**: 期限切れ group の定期回収
//! - **Poller**: 入力元の定期ポーリング（間隔は実行中に変更可）
//! - **RecoveryAdvice**: 失敗を代替メッセージに変換

pub mod builder;
pub mod endpoint;
pub mod guarded;
pub mod poller;
pub mod reaper_loop;
pub mod recovery;
pub mod split_aggregate;

pub use self::builder::{BuildError, Flow, FlowBuilder, RunningFlow, Stage};
pub use self::endpoint::{Endpoint, EndpointGroup, FAILED_MESSAGE_HEADER};
pub use self::guarded::{GuardPolicy, GuardedHandler, register};
pub use self::poller::Poller;
pub use self::reaper_loop::{MIN_REAP_INTERVAL, ReaperLoop};
pub use self::recovery::{RECOVERED_ERROR_HEADER, RecoverFn, RecoveryAdvice};
pub use self::split_aggregate::{SplitAggregate, configure, configure_with};
