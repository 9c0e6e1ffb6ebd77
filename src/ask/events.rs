//! 问答过程事件：推送给编排器作为进度展示，不写入事件日志

use serde::{Deserialize, Serialize};

use crate::ask::state::{AskOutcome, AskPhase};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AskEvent {
    /// 一次状态转换
    Step {
        step: u32,
        state: AskPhase,
        query: String,
        detail: String,
    },
    /// 生成失败，改用原文片段
    Fallback { reason: String },
    Finished {
        outcome: AskOutcome,
        citations: usize,
        reflections: u32,
    },
}

impl AskEvent {
    /// 单行摘要，供客户端打印
    pub fn summary(&self) -> String {
        match self {
            AskEvent::Step { step, state, detail, .. } => {
                format!("{step}. {}: {detail}", state.as_str())
            }
            AskEvent::Fallback { reason } => format!("fallback: {reason}"),
            AskEvent::Finished {
                outcome,
                citations,
                reflections,
            } => format!(
                "finished ({}) with {citations} citation(s) after {reflections} reflection(s)",
                outcome.as_str()
            ),
        }
    }
}
