//! 评分器：检索结果相关性与答案质量
//!
//! 词法评分（分词后的词重叠）总是可用；开启 llm_grading 时额外询问 LLM 的 yes/no 判断，
//! LLM 调用失败或回答无法解析时退回词法结论。

use std::collections::HashSet;
use std::sync::Arc;

use crate::ask::state::{AskAgentConfig, Verdict};
use crate::core::ActivityError;
use crate::index::tokenizer::content_terms;
use crate::index::RetrievedChunk;
use crate::llm::{LlmClient, Message};
use crate::runtime::ActivityRuntime;

/// 改写模板引入的指令词，不代表用户的信息需求
const INSTRUCTION_TERMS: &[&str] = &[
    "provide", "additional", "background", "supporting", "facts", "list", "key", "evidence",
    "citations",
];

const DOCUMENT_GRADER_PROMPT: &str = "You are a relevance grader. Decide whether the document \
helps answer the question. Reply with a single word: yes or no.";

const ANSWER_GRADER_PROMPT: &str = "You are an answer grader. Decide whether the answer addresses \
the question using the cited context. Reply with a single word: yes or no.";

fn query_terms(query: &str) -> HashSet<String> {
    content_terms(query)
        .into_iter()
        .filter(|t| !INSTRUCTION_TERMS.contains(&t.as_str()))
        .collect()
}

/// 词法相关性：chunk 至少包含一个查询内容词；查询没有内容词时非空文本即视为相关
pub fn lexical_relevance(query: &str, text: &str) -> bool {
    if text.trim().is_empty() {
        return false;
    }
    let terms = query_terms(query);
    if terms.is_empty() {
        return true;
    }
    let doc = content_terms(text);
    terms.iter().any(|t| doc.contains(t))
}

/// 解析 yes/no 回答；`<think>` 块会被忽略
pub fn parse_yes_no(raw: &str) -> Option<bool> {
    let cleaned = crate::ask::generator::strip_think(raw).to_lowercase();
    let word = cleaned
        .split(|c: char| !c.is_alphanumeric())
        .find(|w| !w.is_empty())?;
    match word {
        "yes" | "relevant" | "true" | "pass" => Some(true),
        "no" | "irrelevant" | "false" | "fail" => Some(false),
        _ => None,
    }
}

pub struct Grader {
    llm: Option<Arc<dyn LlmClient>>,
    runtime: ActivityRuntime,
    use_llm: bool,
    temperature: f32,
    min_citations: usize,
}

impl Grader {
    pub fn new(runtime: ActivityRuntime, llm: Option<Arc<dyn LlmClient>>, cfg: &AskAgentConfig) -> Self {
        Self {
            use_llm: cfg.llm_grading && llm.is_some(),
            llm,
            runtime,
            temperature: cfg.temperature,
            min_citations: cfg.min_citations,
        }
    }

    async fn ask_llm(&self, activity: &str, system: &str, user: String) -> Option<bool> {
        let llm = self.llm.as_deref().filter(|_| self.use_llm)?;
        let messages = [Message::system(system), Message::user(user)];
        let messages = &messages;
        let temperature = self.temperature;
        match self
            .runtime
            .execute(activity, || async move {
                llm.complete(messages, temperature).await.map_err(ActivityError::from)
            })
            .await
        {
            Ok(reply) => {
                let verdict = parse_yes_no(&reply);
                if verdict.is_none() {
                    tracing::warn!(activity, reply = %reply, "unparseable grader reply, using lexical verdict");
                }
                verdict
            }
            Err(e) => {
                tracing::warn!(activity, error = %e, "LLM grader unavailable, using lexical verdict");
                None
            }
        }
    }

    pub async fn grade_document(&self, query: &str, chunk: &RetrievedChunk) -> bool {
        let lexical = lexical_relevance(query, &chunk.text);
        let prompt = format!("Document:\n{}\n\nQuestion: {}", chunk.text, query);
        self.ask_llm("grade_document", DOCUMENT_GRADER_PROMPT, prompt)
            .await
            .unwrap_or(lexical)
    }

    /// 答案评分：非空且引用数达到 min_citations；可选 LLM 复核
    pub async fn grade_answer(&self, query: &str, answer: &str, citations: usize) -> Verdict {
        if answer.trim().is_empty() {
            return Verdict::Rejected {
                reason: "empty answer".to_string(),
            };
        }
        if citations < self.min_citations {
            return Verdict::Rejected {
                reason: format!(
                    "{citations} citation(s), {} required",
                    self.min_citations
                ),
            };
        }
        let prompt = format!("Answer:\n{answer}\n\nQuestion: {query}");
        match self.ask_llm("grade_answer", ANSWER_GRADER_PROMPT, prompt).await {
            Some(false) => Verdict::Rejected {
                reason: "grader judged the answer off-topic".to_string(),
            },
            _ => Verdict::Accepted { citations },
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::index::ChunkRef;
    use crate::llm::LlmError;

    struct Replying(&'static str);

    #[async_trait]
    impl LlmClient for Replying {
        async fn complete(&self, _: &[Message], _: f32) -> Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    struct Broken;

    #[async_trait]
    impl LlmClient for Broken {
        async fn complete(&self, _: &[Message], _: f32) -> Result<String, LlmError> {
            Err(LlmError::InvalidRequest("model missing".into()))
        }
    }

    fn chunk(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: ChunkRef::new("fp", "c1"),
            ordinal: 0,
            source: "a.md".into(),
            text: text.into(),
            score: 1.0,
        }
    }

    fn cfg(llm_grading: bool, min_citations: usize) -> AskAgentConfig {
        AskAgentConfig {
            llm_grading,
            min_citations,
            ..AskAgentConfig::default()
        }
    }

    #[test]
    fn test_lexical_relevance_ignores_instruction_terms() {
        let q = "Provide additional background and supporting facts for: What is the refund window?";
        assert!(lexical_relevance(q, "The refund window is 30 days."));
        assert!(!lexical_relevance(q, "Background facts about shipping."));
        assert!(!lexical_relevance("anything", "   "));
    }

    #[test]
    fn test_parse_yes_no() {
        assert_eq!(parse_yes_no("Yes."), Some(true));
        assert_eq!(parse_yes_no("<think>hmm yes</think>\nNo"), Some(false));
        assert_eq!(parse_yes_no("maybe"), None);
    }

    #[tokio::test]
    async fn test_llm_grader_overrides_lexical() {
        let grader = Grader::new(ActivityRuntime::default(), Some(Arc::new(Replying("no")) as Arc<dyn LlmClient>), &cfg(true, 1));
        assert!(!grader.grade_document("refund window", &chunk("refund window is 30 days")).await);
    }

    #[tokio::test]
    async fn test_failed_llm_grader_falls_back_to_lexical() {
        let grader = Grader::new(ActivityRuntime::default(), Some(Arc::new(Broken) as Arc<dyn LlmClient>), &cfg(true, 1));
        assert!(grader.grade_document("refund window", &chunk("refund window is 30 days")).await);
    }

    #[tokio::test]
    async fn test_answer_needs_citations() {
        let grader = Grader::new(ActivityRuntime::default(), None, &cfg(false, 1));
        assert!(matches!(
            grader.grade_answer("q", "no markers here", 0).await,
            Verdict::Rejected { .. }
        ));
        assert_eq!(
            grader.grade_answer("q", "cited [1]", 1).await,
            Verdict::Accepted { citations: 1 }
        );
        let lenient = Grader::new(ActivityRuntime::default(), None, &cfg(false, 0));
        assert!(lenient.grade_answer("q", "no markers", 0).await.is_pass());
        assert!(!lenient.grade_answer("q", "  ", 0).await.is_pass());
    }
}
