//! State - サーキットブレーカーの状態

use serde::{Deserialize, Serialize};

/// CircuitState はブレーカーの状態を表現
///
/// # 状態遷移
/// - Closed -> Open: 連続失敗が threshold に達した
/// - Open -> HalfOpen: reset_timeout 経過後の最初の呼び出し（trial）
/// - HalfOpen -> Closed: trial 成功
/// - HalfOpen -> Open: trial 失敗
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Does this state let an ordinary (non-trial) call through?
    pub fn admits_calls(self) -> bool {
        matches!(self, CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_as_screaming_snake_case() {
        let s = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(s, "\"HALF_OPEN\"");
    }

    #[test]
    fn only_closed_admits_calls() {
        assert!(CircuitState::Closed.admits_calls());
        assert!(!CircuitState::Open.admits_calls());
        assert!(!CircuitState::HalfOpen.admits_calls());
    }
}
