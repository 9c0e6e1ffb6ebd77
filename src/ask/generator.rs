//! 答案生成与引用抽取
//!
//! 上下文按 `[n] (source: ...)` 编号交给 LLM；答案中的 `[n]` 标记映射回对应 chunk。
//! 生成在重试后仍失败时返回 [`GenerationUnavailable`]，由引擎改用片段回退。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::ask::state::{first_line, Citation};
use crate::core::{ActivityError, GenerationUnavailable};
use crate::index::RetrievedChunk;
use crate::llm::{LlmClient, Message};
use crate::runtime::ActivityRuntime;

pub const NO_CONTEXT_ANSWER: &str = "I do not have enough information to answer that yet.";

/// 单个上下文块的最大字符数
const MAX_CONTEXT_CHARS: usize = 1200;
/// 回退时最多返回的片段数
const FALLBACK_SNIPPETS: usize = 3;

const GENERATOR_PROMPT: &str = "You answer questions using only the numbered context blocks. \
Cite every fact with the block number in square brackets, e.g. [1]. \
If the context does not contain the answer, say so briefly.";

static CITATION_RE: OnceLock<Option<Regex>> = OnceLock::new();
static THINK_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 去掉推理模型输出的 `<think>...</think>` 块
pub fn strip_think(text: &str) -> String {
    match THINK_RE
        .get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").ok())
        .as_ref()
    {
        Some(re) => re.replace_all(text, "").trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// 编号上下文，`[1]` 对应 chunks[0]
pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let text = c.text.trim();
            let text = if text.chars().count() > MAX_CONTEXT_CHARS {
                let cut: String = text.chars().take(MAX_CONTEXT_CHARS).collect();
                format!("{}...", cut.trim_end())
            } else {
                text.to_string()
            };
            format!("[{}] (source: {})\n{}", i + 1, c.location(), text)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// 抽取有效引用：按首次出现排序，去重，超出范围的编号丢弃
pub fn extract_citations(answer: &str, chunks: &[RetrievedChunk]) -> Vec<Citation> {
    let Some(re) = CITATION_RE
        .get_or_init(|| Regex::new(r"\[(\d+)\]").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut citations = Vec::new();
    for cap in re.captures_iter(answer) {
        let Ok(marker) = cap[1].parse::<usize>() else {
            continue;
        };
        if marker == 0 || marker > chunks.len() || !seen.insert(marker) {
            continue;
        }
        let chunk = &chunks[marker - 1];
        // 同一 chunk 以不同编号出现时只计一次
        if citations.iter().any(|c: &Citation| c.chunk == chunk.chunk) {
            continue;
        }
        citations.push(Citation {
            marker,
            chunk: chunk.chunk.clone(),
            location: chunk.location(),
        });
    }
    citations
}

/// 生成草稿
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// 片段回退：最多三个 `[n] 首行 (位置)`
pub fn fallback_answer(chunks: &[RetrievedChunk]) -> Draft {
    if chunks.is_empty() {
        return Draft {
            answer: NO_CONTEXT_ANSWER.to_string(),
            citations: Vec::new(),
        };
    }
    let picked = &chunks[..chunks.len().min(FALLBACK_SNIPPETS)];
    let answer = picked
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[{}] {} ({})", i + 1, first_line(&c.text, 240), c.location()))
        .collect::<Vec<_>>()
        .join("\n");
    let citations = extract_citations(&answer, picked);
    Draft { answer, citations }
}

pub struct AnswerGenerator {
    llm: Option<Arc<dyn LlmClient>>,
    runtime: ActivityRuntime,
    temperature: f32,
}

impl AnswerGenerator {
    pub fn new(runtime: ActivityRuntime, llm: Option<Arc<dyn LlmClient>>, temperature: f32) -> Self {
        Self {
            llm,
            runtime,
            temperature,
        }
    }

    pub async fn generate(&self, question: &str, chunks: &[RetrievedChunk]) -> Result<Draft, GenerationUnavailable> {
        if chunks.is_empty() {
            return Ok(Draft {
                answer: NO_CONTEXT_ANSWER.to_string(),
                citations: Vec::new(),
            });
        }
        let llm = self
            .llm
            .as_deref()
            .ok_or_else(|| GenerationUnavailable("no language model configured".to_string()))?;

        let prompt = format!("Context:\n{}\n\nQuestion: {}", build_context(chunks), question);
        let messages = [Message::system(GENERATOR_PROMPT), Message::user(prompt)];
        let messages = &messages;
        let temperature = self.temperature;
        let raw = self
            .runtime
            .execute("generate", || async move {
                llm.complete(messages, temperature).await.map_err(ActivityError::from)
            })
            .await
            .map_err(|e| GenerationUnavailable(e.reason()))?;

        let answer = strip_think(&raw);
        if answer.is_empty() {
            return Err(GenerationUnavailable("model returned only reasoning".to_string()));
        }
        let citations = extract_citations(&answer, chunks);
        Ok(Draft { answer, citations })
    }
}
