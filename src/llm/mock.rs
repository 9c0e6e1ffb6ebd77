//! Mock LLM 客户端（离线演示与测试，无需模型服务）
//!
//! 评分类请求一律回答 yes；带编号上下文的请求取 `[1]` 的首句作答并引用 `[1]`；
//! 其余请求回显 `Question:` 行，相当于不改写查询。

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn first_context_sentence(text: &str) -> Option<String> {
        let start = text.find("[1]")?;
        let rest = text[start + 3..].trim_start();
        let block = rest.split("\n[2]").next().unwrap_or(rest);
        // 跳过来源行 "(source: ...)"
        let body = block
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with("(source"))?;
        let sentence = body
            .split_inclusive(['.', '。', '!', '?'])
            .next()
            .unwrap_or(body)
            .trim();
        (!sentence.is_empty()).then(|| sentence.to_string())
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
        let system = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");

        if system.contains("grader") {
            return Ok("yes".to_string());
        }
        if let Some(sentence) = Self::first_context_sentence(last_user) {
            return Ok(format!("{sentence} [1]"));
        }
        let question = last_user
            .lines()
            .rev()
            .find_map(|l| l.trim().strip_prefix("Question:"))
            .map(str::trim)
            .unwrap_or(last_user.trim());
        if question.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(question.to_string())
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}
