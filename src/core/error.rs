//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 ActivityError 决定 RetryAfter / GiveUp。
//! 命令解析错误、活动失败均在所属组件边界转换为结果；只有事件日志损坏是致命的。

use std::time::Duration;

use thiserror::Error;

/// 用户输入无法解析为命令（本地、非致命，记录为 status=error 的结果）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("No command given")]
    Empty,

    #[error("Unbalanced quotes in: {0}")]
    UnbalancedQuotes(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// 活动（detect / parse / embed / retrieve / generate ...）执行失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    #[error("activity {0} timed out")]
    Timeout(String),

    /// 可重试的瞬时失败（网络、限流、资源暂不可用）
    #[error("transient failure: {0}")]
    Transient(String),

    /// 输入本身有问题，重试无意义
    #[error("{0}")]
    Rejected(String),

    #[error("{activity} failed after {attempts} attempt(s): {reason}")]
    Exhausted {
        activity: String,
        attempts: u32,
        reason: String,
    },
}

impl ActivityError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivityError::Timeout(_) | ActivityError::Transient(_))
    }

    /// 去掉 Exhausted 包装后的原因，用于展示
    pub fn reason(&self) -> String {
        match self {
            ActivityError::Exhausted { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// 生成活动在重试后仍不可用；问答引擎据此进入片段回退，而不是报错
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("generation unavailable: {0}")]
pub struct GenerationUnavailable(pub String);

/// 恢复引擎根据错误与已尝试次数给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重试
    RetryAfter(Duration),
    /// 放弃，向调用方报告
    GiveUp,
}
