//! 问答：检索-反思状态机
//!
//! - [`AskEngine`]：有界的 analyze / retrieve / grade / rewrite / generate 循环
//! - [`Grader`]：词法评分，可选 LLM 复核
//! - [`QueryRewriter`] / [`AnswerGenerator`]：LLM 改写与生成，均带确定性回退

pub mod analysis;
pub mod engine;
pub mod events;
pub mod generator;
pub mod grader;
pub mod rewriter;
pub mod state;

use serde::{Deserialize, Serialize};

pub use engine::AskEngine;
pub use events::AskEvent;
pub use generator::{AnswerGenerator, Draft, NO_CONTEXT_ANSWER};
pub use grader::Grader;
pub use rewriter::QueryRewriter;
pub use state::{AskAgentConfig, AskAnswer, AskOutcome, AskPhase, AskState, Citation, ReasoningStep, Verdict};

/// 编排器发给问答子执行的请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    pub config: AskAgentConfig,
}
