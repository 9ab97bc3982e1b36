//! Config - フロー設定の読み込み
//!
//! JSON ファイル（省略可）→ `RELAY_*` 環境変数の順に適用し、最後に validate します。
//! 時間は全てミリ秒で指定します。
//!
//! | 環境変数 | フィールド |
//! |---|---|
//! | `RELAY_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `RELAY_RETRY_INITIAL_BACKOFF_MS` | `retry.initial_backoff_ms` |
//! | `RELAY_RETRY_MULTIPLIER` | `retry.multiplier` |
//! | `RELAY_RETRY_MAX_BACKOFF_MS` | `retry.max_backoff_ms` |
//! | `RELAY_BREAKER_FAILURE_THRESHOLD` | `breaker.failure_threshold` |
//! | `RELAY_BREAKER_RESET_TIMEOUT_MS` | `breaker.reset_timeout_ms` |
//! | `RELAY_GROUP_TIMEOUT_MS` | `aggregator.group_timeout_ms` |
//! | `RELAY_REAPER_INTERVAL_MS` | `aggregator.reaper_interval_ms` |
//! | `RELAY_CHANNEL_CAPACITY` | `channel.capacity` |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{AggregatorConfig, ExpiryPolicy};
use crate::channel::Channel;
use crate::circuit::CircuitBreakerConfig;
use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub retry: RetrySettings,
    pub breaker: BreakerSettings,
    pub aggregator: AggregatorSettings,
    pub channel: ChannelSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1_000,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub group_timeout_ms: u64,
    pub reaper_interval_ms: u64,
    pub expiry: ExpiryPolicy,
    pub tombstone_retention_ms: u64,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            group_timeout_ms: 30_000,
            reaper_interval_ms: 1_000,
            expiry: ExpiryPolicy::Discard,
            tombstone_retention_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// `None` means unbounded.
    pub capacity: Option<usize>,
}

impl FlowConfig {
    /// Defaults, then `RELAY_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// JSON file, then `RELAY_*` overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse only; no overrides, no validation.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_with(&lookup, "RELAY_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        override_with(&lookup, "RELAY_RETRY_INITIAL_BACKOFF_MS", &mut self.retry.initial_backoff_ms)?;
        override_with(&lookup, "RELAY_RETRY_MULTIPLIER", &mut self.retry.multiplier)?;
        override_with(&lookup, "RELAY_RETRY_MAX_BACKOFF_MS", &mut self.retry.max_backoff_ms)?;
        override_with(&lookup, "RELAY_BREAKER_FAILURE_THRESHOLD", &mut self.breaker.failure_threshold)?;
        override_with(&lookup, "RELAY_BREAKER_RESET_TIMEOUT_MS", &mut self.breaker.reset_timeout_ms)?;
        override_with(&lookup, "RELAY_GROUP_TIMEOUT_MS", &mut self.aggregator.group_timeout_ms)?;
        override_with(&lookup, "RELAY_REAPER_INTERVAL_MS", &mut self.aggregator.reaper_interval_ms)?;

        if let Some(raw) = lookup("RELAY_CHANNEL_CAPACITY") {
            let capacity = raw.parse().map_err(|_| ConfigError::Env {
                key: "RELAY_CHANNEL_CAPACITY",
                value: raw.clone(),
            })?;
            self.channel.capacity = Some(capacity);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 7] = [
            (self.retry.max_attempts == 0, "retry.max_attempts must be at least 1"),
            (
                !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0,
                "retry.multiplier must be a finite number >= 1.0",
            ),
            (
                self.retry.max_backoff_ms < self.retry.initial_backoff_ms,
                "retry.max_backoff_ms must not be below retry.initial_backoff_ms",
            ),
            (self.breaker.failure_threshold == 0, "breaker.failure_threshold must be at least 1"),
            (self.aggregator.group_timeout_ms == 0, "aggregator.group_timeout_ms must be positive"),
            (self.aggregator.reaper_interval_ms == 0, "aggregator.reaper_interval_ms must be positive"),
            (self.channel.capacity == Some(0), "channel.capacity must be positive when set"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ConfigError::Invalid((*reason).to_string())),
            None => Ok(()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Backoff::Exponential {
                initial: Duration::from_millis(self.retry.initial_backoff_ms),
                multiplier: self.retry.multiplier,
                max: Duration::from_millis(self.retry.max_backoff_ms),
                jitter: self.retry.jitter,
            },
        )
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            group_timeout: Duration::from_millis(self.aggregator.group_timeout_ms),
            expiry: self.aggregator.expiry,
            tombstone_retention: Duration::from_millis(self.aggregator.tombstone_retention_ms),
        }
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.aggregator.reaper_interval_ms)
    }

    /// A channel sized by `channel.capacity` (unbounded when unset).
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        match self.channel.capacity {
            Some(capacity) => Channel::bounded(name, capacity),
            None => Channel::new(name),
        }
    }
}

fn override_with<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { key, value: raw.clone() })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FlowError, Message};
    use rstest::rstest;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_json_gives_defaults() {
        let config = FlowConfig::from_json("{}").unwrap();
        assert_eq!(config, FlowConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config = FlowConfig::from_json(
            r#"{ "breaker": { "failure_threshold": 2 }, "aggregator": { "expiry": "release_partial" } }"#,
        )
        .unwrap();
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.reset_timeout_ms, 30_000);
        assert_eq!(config.aggregator_config().expiry, ExpiryPolicy::ReleasePartial);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = FlowConfig::from_json(r#"{ "retry": { "max_attempts": 7 } }"#).unwrap();
        config
            .apply_overrides(env(&[
                ("RELAY_RETRY_MAX_ATTEMPTS", "4"),
                ("RELAY_GROUP_TIMEOUT_MS", "2500"),
                ("RELAY_CHANNEL_CAPACITY", "16"),
            ]))
            .unwrap();

        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.aggregator_config().group_timeout, Duration::from_millis(2500));
        assert_eq!(config.channel.capacity, Some(16));
    }

    #[tokio::test]
    async fn channels_follow_configured_capacity() {
        let unbounded = FlowConfig::default().channel("in");
        assert_eq!(unbounded.capacity(), None);

        let mut config = FlowConfig::default();
        config.apply_overrides(env(&[("RELAY_CHANNEL_CAPACITY", "1")])).unwrap();
        let bounded = config.channel("in");
        assert_eq!((bounded.name(), bounded.capacity()), ("in", Some(1)));

        bounded.try_send(Message::new(serde_json::json!(1))).await.unwrap();
        assert!(matches!(
            bounded.try_send(Message::new(serde_json::json!(2))).await,
            Err(FlowError::ChannelFull(_))
        ));
    }

    #[test]
    fn unparsable_env_value_is_reported() {
        let mut config = FlowConfig::default();
        let err = config
            .apply_overrides(env(&[("RELAY_BREAKER_FAILURE_THRESHOLD", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Env { key: "RELAY_BREAKER_FAILURE_THRESHOLD", .. }
        ));
    }

    #[rstest]
    #[case(r#"{ "retry": { "max_attempts": 0 } }"#)]
    #[case(r#"{ "retry": { "multiplier": 0.5 } }"#)]
    #[case(r#"{ "retry": { "initial_backoff_ms": 5000, "max_backoff_ms": 100 } }"#)]
    #[case(r#"{ "breaker": { "failure_threshold": 0 } }"#)]
    #[case(r#"{ "aggregator": { "group_timeout_ms": 0 } }"#)]
    #[case(r#"{ "aggregator": { "reaper_interval_ms": 0 } }"#)]
    #[case(r#"{ "channel": { "capacity": 0 } }"#)]
    fn validate_rejects_degenerate_settings(#[case] raw: &str) {
        let config = FlowConfig::from_json(raw).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            FlowConfig::from_json("{ retry: "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = FlowConfig::load("/nonexistent/relay.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
