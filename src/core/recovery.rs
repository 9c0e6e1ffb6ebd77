//! 错误恢复引擎
//!
//! 根据 ActivityError 类型与已尝试次数返回 RecoveryAction：瞬时失败按指数退避重试，其余立即放弃。

use std::time::Duration;

use crate::config::RuntimeSection;
use crate::core::{ActivityError, RecoveryAction};

/// 重试策略：最多尝试 max_attempts 次，退避从 initial_backoff 起翻倍，封顶 max_backoff
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RecoveryEngine {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    pub fn from_config(cfg: &RuntimeSection) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.initial_backoff_ms),
            Duration::from_millis(cfg.max_backoff_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// attempt 从 1 开始计数，表示刚刚失败的是第几次尝试
    pub fn handle(&self, err: &ActivityError, attempt: u32) -> RecoveryAction {
        if !err.is_retryable() || attempt >= self.max_attempts {
            return RecoveryAction::GiveUp;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        let delay = self
            .initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff);
        RecoveryAction::RetryAfter(delay)
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::from_config(&RuntimeSection::default())
    }
}
