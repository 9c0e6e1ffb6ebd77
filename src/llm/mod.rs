//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）与嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, Message, Role};

use crate::config::LlmSection;

/// 根据配置创建 LLM 客户端；关闭时返回 None，问答将走片段回退
pub fn create_llm_from_config(cfg: &LlmSection, use_mock: bool) -> Option<Arc<dyn LlmClient>> {
    if use_mock {
        tracing::warn!("Using Mock LLM");
        return Some(Arc::new(MockLlmClient));
    }
    if !cfg.enabled {
        tracing::warn!("LLM disabled, answers will be raw snippets");
        return None;
    }
    tracing::info!("Using OpenAI-compatible LLM ({}) at {}", cfg.model, cfg.base_url);
    Some(Arc::new(OpenAiClient::new(
        &cfg.base_url,
        &cfg.model,
        cfg.api_key.as_deref(),
        Duration::from_secs(cfg.request_timeout_secs.max(1)),
    )))
}
