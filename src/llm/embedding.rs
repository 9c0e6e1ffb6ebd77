//! 嵌入 API：供向量索引使用，调用 OpenAI 兼容的 /embeddings 端点

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::llm::openai::openai_config;
use crate::llm::LlmError;

/// 嵌入提供方
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 将文本编码为向量；空文本返回空向量
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;

    fn model_name(&self) -> &str;
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            client: Client::with_config(openai_config(base_url, api_key)),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![]);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| LlmError::InvalidRequest(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;
        response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .filter(|v| !v.is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// 从应用配置创建嵌入提供方；未配置 embedding_model 或 LLM 关闭时返回 None（仅关键词检索）
pub fn create_embedder_from_config(cfg: &LlmSection) -> Option<Arc<dyn EmbeddingProvider>> {
    if !cfg.enabled {
        return None;
    }
    let model = cfg.embedding_model.as_deref()?.trim();
    if model.is_empty() {
        tracing::debug!("embedding skipped: empty embedding_model");
        return None;
    }
    tracing::info!("Using embeddings ({}) at {}", model, cfg.base_url);
    Some(Arc::new(OpenAiEmbedder::new(
        &cfg.base_url,
        model,
        cfg.api_key.as_deref(),
    )))
}
