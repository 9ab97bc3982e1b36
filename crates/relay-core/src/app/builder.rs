//! FlowBuilder - フローの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::info;

use crate::channel::Channel;
use crate::observability::FlowStatus;
use crate::ports::MessageHandler;

use super::endpoint::{Endpoint, EndpointGroup};

/// One handler stage, referring to channels by name.
pub struct Stage {
    name: String,
    handler: Arc<dyn MessageHandler>,
    input: Option<String>,
    output: Option<String>,
    errors: Option<String>,
    workers: usize,
}

impl Stage {
    pub fn new(name: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            input: None,
            output: None,
            errors: None,
            workers: 1,
        }
    }

    pub fn from(mut self, channel: impl Into<String>) -> Self {
        self.input = Some(channel.into());
        self
    }

    pub fn to(mut self, channel: impl Into<String>) -> Self {
        self.output = Some(channel.into());
        self
    }

    pub fn errors_to(mut self, channel: impl Into<String>) -> Self {
        self.errors = Some(channel.into());
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    fn referenced_channels(&self) -> impl Iterator<Item = &String> {
        self.input.iter().chain(&self.output).chain(&self.errors)
    }
}

/// FlowBuilder は名前付きフローを構築
///
/// # 使用例
/// ```ignore
/// let flow = FlowBuilder::new("orders")
///     .channel(Channel::new("in"))
///     .channel(Channel::new("out"))
///     .stage(Stage::new("enrich", handler).from("in").to("out"))
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - stage が参照するチャネルは全て `channel()` で宣言されている必要がある
/// - build() 時に「参照集合 ⊆ 宣言済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct FlowBuilder {
    name: String,
    channels: BTreeMap<String, Arc<Channel>>,
    duplicate_channel: Option<String>,
    stages: Vec<Stage>,
}

/// BuildError はフロー構築時のエラー
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("Missing channels: {0:?}. These channels are referenced by stages but were never declared.")]
    MissingChannels(Vec<String>),

    #[error("Stage '{0}' has no input channel.")]
    MissingInput(String),

    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("Duplicate channel name: {0}")]
    DuplicateChannel(String),
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: BTreeMap::new(),
            duplicate_channel: None,
            stages: Vec::new(),
        }
    }

    /// Declare a channel. Declaring the same name twice fails at `build()`.
    pub fn channel(self, channel: Channel) -> Self {
        self.shared_channel(Arc::new(channel))
    }

    /// Declare a channel that is also held outside the flow.
    pub fn shared_channel(mut self, channel: Arc<Channel>) -> Self {
        let name = channel.name().to_string();
        if self.channels.contains_key(&name) {
            // 重複は build() で報告する
            self.duplicate_channel.get_or_insert(name);
        } else {
            self.channels.insert(name, channel);
        }
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// # 検証
    /// - チャネル名・stage 名の重複
    /// - 入力チャネルのない stage
    /// - 宣言されていないチャネルへの参照（全件まとめて報告）
    pub fn build(self) -> Result<Flow, BuildError> {
        if let Some(dup) = self.duplicate_channel {
            return Err(BuildError::DuplicateChannel(dup));
        }

        let mut seen = BTreeSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(BuildError::DuplicateStage(stage.name.clone()));
            }
            if stage.input.is_none() {
                return Err(BuildError::MissingInput(stage.name.clone()));
            }
        }

        let missing: Vec<String> = self
            .stages
            .iter()
            .flat_map(Stage::referenced_channels)
            .filter(|c| !self.channels.contains_key(*c))
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingChannels(missing));
        }

        Ok(Flow {
            name: self.name,
            channels: self.channels,
            stages: self.stages,
        })
    }
}

/// A validated flow, ready to start.
pub struct Flow {
    name: String,
    channels: BTreeMap<String, Arc<Channel>>,
    stages: Vec<Stage>,
}

impl Flow {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).cloned()
    }

    /// Spawn the endpoint workers of every stage.
    pub fn start(self) -> RunningFlow {
        let groups = self
            .stages
            .into_iter()
            .filter_map(|stage| {
                let input = self.channels.get(stage.input.as_deref()?)?;
                let mut endpoint = Endpoint::new(stage.name, Arc::clone(input), stage.handler);
                endpoint.output = stage.output.and_then(|c| self.channels.get(&c).cloned());
                endpoint.errors = stage.errors.and_then(|c| self.channels.get(&c).cloned());
                Some(EndpointGroup::spawn(stage.workers, endpoint))
            })
            .collect::<Vec<_>>();

        info!(flow = %self.name, stages = groups.len(), channels = self.channels.len(), "flow started");
        RunningFlow {
            name: self.name,
            channels: self.channels,
            groups,
        }
    }
}

pub struct RunningFlow {
    name: String,
    channels: BTreeMap<String, Arc<Channel>>,
    groups: Vec<EndpointGroup>,
}

impl RunningFlow {
    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.get(name).cloned()
    }

    pub async fn status(&self) -> FlowStatus {
        let mut channels = BTreeMap::new();
        for (name, channel) in &self.channels {
            channels.insert(name.clone(), channel.len().await);
        }
        FlowStatus {
            name: self.name.clone(),
            channels,
        }
    }

    /// Stop all stages. Messages already taken by a worker finish handling.
    pub async fn shutdown_and_join(self) {
        for group in self.groups {
            group.shutdown_and_join().await;
        }
        info!(flow = %self.name, "flow stopped");
    }
}
