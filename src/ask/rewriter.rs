//! 查询改写
//!
//! 有 LLM 时根据原问题、未通过的判定和不相关片段改写查询；
//! 没有 LLM、调用失败或输出为空时使用固定模板。

use std::sync::Arc;

use crate::ask::generator::strip_think;
use crate::ask::state::Verdict;
use crate::core::ActivityError;
use crate::llm::{LlmClient, Message};
use crate::runtime::ActivityRuntime;

const REWRITER_PROMPT: &str = "You rewrite search queries for a document retrieval system. \
Produce one improved query that is more likely to find passages answering the question. \
Reply with the query only.";

/// 模板改写：缺上下文时要背景材料，答案未通过时要带引用的证据
pub fn template_rewrite(original: &str, verdict: Option<&Verdict>) -> String {
    match verdict {
        Some(Verdict::Rejected { .. }) => {
            format!("List the key evidence with citations for: {original}")
        }
        _ => format!("Provide additional background and supporting facts for: {original}"),
    }
}

pub struct QueryRewriter {
    llm: Option<Arc<dyn LlmClient>>,
    runtime: ActivityRuntime,
    temperature: f32,
}

impl QueryRewriter {
    pub fn new(runtime: ActivityRuntime, llm: Option<Arc<dyn LlmClient>>, temperature: f32) -> Self {
        Self {
            llm,
            runtime,
            temperature,
        }
    }

    pub async fn rewrite(&self, original: &str, verdict: Option<&Verdict>, irrelevant: &[String]) -> String {
        let Some(llm) = self.llm.as_deref() else {
            return template_rewrite(original, verdict);
        };

        let mut prompt = String::new();
        if let Some(v) = verdict {
            prompt.push_str(&format!("Previous attempt: {}\n", v.describe()));
        }
        if !irrelevant.is_empty() {
            prompt.push_str("Passages that did not help:\n");
            for snippet in irrelevant {
                prompt.push_str(&format!("- {snippet}\n"));
            }
        }
        prompt.push_str(&format!("\nQuestion: {original}"));

        let messages = [Message::system(REWRITER_PROMPT), Message::user(prompt)];
        let messages = &messages;
        let temperature = self.temperature;
        let rewritten = self
            .runtime
            .execute("rewrite", || async move {
                llm.complete(messages, temperature).await.map_err(ActivityError::from)
            })
            .await
            .map(|raw| clean_query(&raw));

        match rewritten {
            Ok(q) if !q.is_empty() => q,
            Ok(_) => template_rewrite(original, verdict),
            Err(e) => {
                tracing::warn!(error = %e, "query rewrite failed, using template");
                template_rewrite(original, verdict)
            }
        }
    }
}

/// 取首个非空行，去掉引号与 `Query:` 前缀
fn clean_query(raw: &str) -> String {
    let text = strip_think(raw);
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let line = line
        .strip_prefix("Query:")
        .or_else(|| line.strip_prefix("query:"))
        .unwrap_or(line);
    line.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim().to_string()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::llm::LlmError;

    struct Fixed(&'static str);

    #[async_trait]
    impl LlmClient for Fixed {
        async fn complete(&self, _: &[Message], _: f32) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn test_templates() {
        let insufficient = Verdict::Insufficient { relevant: 0, required: 1 };
        assert_eq!(
            template_rewrite("refund window?", Some(&insufficient)),
            "Provide additional background and supporting facts for: refund window?"
        );
        let rejected = Verdict::Rejected { reason: "0 citation(s)".into() };
        assert_eq!(
            template_rewrite("refund window?", Some(&rejected)),
            "List the key evidence with citations for: refund window?"
        );
    }

    #[tokio::test]
    async fn test_llm_rewrite_is_cleaned() {
        let rewriter = QueryRewriter::new(
            ActivityRuntime::default(),
            Some(Arc::new(Fixed("<think>x</think>\nQuery: \"refund policy days\"")) as Arc<dyn LlmClient>),
            0.0,
        );
        assert_eq!(rewriter.rewrite("q", None, &[]).await, "refund policy days");
    }

    #[tokio::test]
    async fn test_blank_llm_output_uses_template() {
        let rewriter = QueryRewriter::new(
            ActivityRuntime::default(),
            Some(Arc::new(Fixed("  ")) as Arc<dyn LlmClient>),
            0.0,
        );
        assert!(rewriter
            .rewrite("q", None, &[])
            .await
            .starts_with("Provide additional background"));
    }
}
