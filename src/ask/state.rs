//! 问答执行状态：配置、判定、推理轨迹与去重后的检索集合

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::AskSection;
use crate::index::{ChunkKey, ChunkRef, RetrievedChunk};

/// 单次问答的配置，运行期间不变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskAgentConfig {
    pub top_k: usize,
    pub max_reflections: u32,
    pub min_citations: usize,
    pub reflection_enabled: bool,
    pub temperature: f32,
    #[serde(default = "default_neighbor_span")]
    pub neighbor_span: u32,
    #[serde(default = "default_max_subquestions")]
    pub max_subquestions: usize,
    #[serde(default)]
    pub llm_grading: bool,
}

fn default_neighbor_span() -> u32 {
    1
}

fn default_max_subquestions() -> usize {
    3
}

impl Default for AskAgentConfig {
    fn default() -> Self {
        Self::from_section(&AskSection::default())
    }
}

impl AskAgentConfig {
    pub fn from_section(cfg: &AskSection) -> Self {
        Self {
            top_k: cfg.top_k.max(1),
            max_reflections: cfg.max_reflections,
            min_citations: cfg.min_citations,
            reflection_enabled: cfg.reflection_enabled,
            temperature: cfg.temperature,
            neighbor_span: cfg.neighbor_span,
            max_subquestions: cfg.max_subquestions.max(1),
            llm_grading: cfg.llm_grading,
        }
    }

    /// 实际可用的反思次数；关闭反思等价于 0
    pub fn reflection_budget(&self) -> u32 {
        if self.reflection_enabled {
            self.max_reflections
        } else {
            0
        }
    }

    /// 判定检索结果足够所需的相关 chunk 数
    pub fn relevance_threshold(&self) -> usize {
        self.min_citations.max(1)
    }

    /// 每轮检索中同一来源排在前面的 chunk 数，其余排到后面
    pub fn max_per_source(&self) -> usize {
        (self.neighbor_span as usize + 1).max(2)
    }

    /// 状态转换的硬上限
    pub fn transition_limit(&self) -> u32 {
        self.max_reflections
            .saturating_add(1)
            .saturating_mul(8)
            .saturating_add(8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskPhase {
    Analyze,
    Retrieve,
    GradeDocuments,
    Rewrite,
    Generate,
    GradeAnswer,
    Finish,
}

impl AskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskPhase::Analyze => "analyze",
            AskPhase::Retrieve => "retrieve",
            AskPhase::GradeDocuments => "grade_documents",
            AskPhase::Rewrite => "rewrite",
            AskPhase::Generate => "generate",
            AskPhase::GradeAnswer => "grade_answer",
            AskPhase::Finish => "finish",
        }
    }
}

/// 评分结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// 检索到足够的相关 chunk
    Relevant { relevant: usize },
    /// 相关 chunk 不足，需要更多上下文
    Insufficient { relevant: usize, required: usize },
    Accepted { citations: usize },
    Rejected { reason: String },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Relevant { .. } | Verdict::Accepted { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            Verdict::Relevant { relevant } => format!("{relevant} relevant chunk(s)"),
            Verdict::Insufficient { relevant, required } => {
                format!("only {relevant} relevant chunk(s), {required} required")
            }
            Verdict::Accepted { citations } => format!("answer accepted with {citations} citation(s)"),
            Verdict::Rejected { reason } => format!("answer rejected: {reason}"),
        }
    }
}

/// 推理轨迹中的一步
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub state: AskPhase,
    pub query: String,
    pub verdict: Option<Verdict>,
    pub detail: String,
}

/// 按身份去重的 chunk 集合，保持首次出现的顺序
#[derive(Debug, Clone, Default)]
pub struct ChunkSet {
    items: Vec<RetrievedChunk>,
    positions: HashMap<ChunkKey, usize>,
}

impl ChunkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已存在时只合并 neighbor_offsets，返回 false
    pub fn insert(&mut self, chunk: RetrievedChunk) -> bool {
        let key = chunk.key();
        if let Some(&pos) = self.positions.get(&key) {
            let existing = &mut self.items[pos];
            existing
                .chunk
                .neighbor_offsets
                .extend(chunk.chunk.neighbor_offsets.iter().copied());
            return false;
        }
        self.positions.insert(key, self.items.len());
        self.items.push(chunk);
        true
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.positions.contains_key(key)
    }

    pub fn get(&self, key: &ChunkKey) -> Option<&RetrievedChunk> {
        self.positions.get(key).map(|&pos| &self.items[pos])
    }

    pub fn get_mut(&mut self, key: &ChunkKey) -> Option<&mut RetrievedChunk> {
        self.positions.get(key).map(|&pos| &mut self.items[pos])
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetrievedChunk> {
        self.items.iter()
    }
}

/// 单次问答执行独占的状态，完成后丢弃
#[derive(Debug, Clone)]
pub struct AskState {
    pub original_query: String,
    pub active_query: String,
    /// 下一轮检索要发出的查询
    pub sub_questions: Vec<String>,
    pub retrieved_chunks: ChunkSet,
    pub reflections_done: u32,
    pub citations_count: usize,
    pub verdict_history: Vec<Verdict>,
    /// 判为相关的 chunk，按判定顺序
    pub relevant: Vec<ChunkKey>,
    pub irrelevant: HashSet<ChunkKey>,
    pub draft: Option<String>,
    pub citations: Vec<Citation>,
    pub trace: Vec<ReasoningStep>,
    /// 下一轮检索是否扩展相邻 chunk
    pub expand_neighbors: bool,
}

impl AskState {
    pub fn new(question: &str) -> Self {
        let question = question.trim().to_string();
        Self {
            active_query: question.clone(),
            sub_questions: vec![question.clone()],
            original_query: question,
            retrieved_chunks: ChunkSet::new(),
            reflections_done: 0,
            citations_count: 0,
            verdict_history: Vec::new(),
            relevant: Vec::new(),
            irrelevant: HashSet::new(),
            draft: None,
            citations: Vec::new(),
            trace: Vec::new(),
            expand_neighbors: false,
        }
    }

    pub fn is_graded(&self, key: &ChunkKey) -> bool {
        self.irrelevant.contains(key) || self.relevant.contains(key)
    }

    pub fn ungraded(&self) -> Vec<RetrievedChunk> {
        self.retrieved_chunks
            .iter()
            .filter(|c| !self.is_graded(&c.key()))
            .cloned()
            .collect()
    }

    pub fn relevant_chunks(&self) -> Vec<RetrievedChunk> {
        self.relevant
            .iter()
            .filter_map(|k| self.retrieved_chunks.get(k))
            .cloned()
            .collect()
    }

    /// 生成所用的 chunk：优先相关集合，否则按分数取检索到的最佳 top_k
    pub fn context_chunks(&self, top_k: usize) -> Vec<RetrievedChunk> {
        let relevant = self.relevant_chunks();
        if !relevant.is_empty() {
            return relevant;
        }
        let mut best: Vec<RetrievedChunk> = self.retrieved_chunks.iter().cloned().collect();
        best.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        best.truncate(top_k.max(1));
        best
    }

    pub fn irrelevant_snippets(&self, limit: usize) -> Vec<String> {
        self.retrieved_chunks
            .iter()
            .filter(|c| self.irrelevant.contains(&c.key()))
            .take(limit)
            .map(|c| first_line(&c.text, 160))
            .collect()
    }

    pub fn last_verdict(&self) -> Option<&Verdict> {
        self.verdict_history.last()
    }

    pub fn record(&mut self, state: AskPhase, verdict: Option<Verdict>, detail: impl Into<String>) {
        if let Some(v) = &verdict {
            self.verdict_history.push(v.clone());
        }
        self.trace.push(ReasoningStep {
            state,
            query: self.active_query.clone(),
            verdict,
            detail: detail.into(),
        });
    }
}

/// 取首个非空行，按字符截断
pub fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.chars().count() > max_chars {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    } else {
        line.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskOutcome {
    /// 答案通过评分
    Satisfied,
    /// 反思预算用尽，返回尽力而为的答案
    Exhausted,
    /// 生成不可用，返回原文片段
    Fallback,
}

impl AskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AskOutcome::Satisfied => "satisfied",
            AskOutcome::Exhausted => "exhausted",
            AskOutcome::Fallback => "fallback",
        }
    }
}

/// 答案中的一个引用：`[marker]` 对应的 chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub marker: usize,
    pub chunk: ChunkRef,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub reasoning_trace: Vec<ReasoningStep>,
    pub reflections_done: u32,
    pub outcome: AskOutcome,
}

impl AskAnswer {
    pub fn citation_refs(&self) -> Vec<ChunkRef> {
        self.citations.iter().map(|c| c.chunk.clone()).collect()
    }

    pub fn render(&self) -> String {
        let mut out = self.answer.trim().to_string();
        if !self.citations.is_empty() {
            out.push_str("\n\nCitations:");
            for c in &self.citations {
                out.push_str(&format!("\n  [{}] {}", c.marker, c.location));
            }
        }
        out.push_str(&format!(
            "\n\nReflections: {} ({})",
            self.reflections_done,
            self.outcome.as_str()
        ));
        out
    }
}
