//! 检索-反思主循环
//!
//! analyze -> retrieve -> grade_documents -> {generate | rewrite}；generate -> grade_answer -> {finish | rewrite}。
//! rewrite 在反思预算用尽时短路：来自 grade_documents 的转入 generate，来自 grade_answer 的以 exhausted 结束。
//! analyze 把复合问题拆成子问题，首轮检索逐个查询；反思后的检索同时查原问题与改写结果。
//! 每次状态转换写入推理轨迹，并可选推送 [`AskEvent`]。

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ask::analysis::{followup_queries, rerank_by_source, split_subquestions};
use crate::ask::events::AskEvent;
use crate::ask::generator::{fallback_answer, AnswerGenerator};
use crate::ask::grader::Grader;
use crate::ask::rewriter::QueryRewriter;
use crate::ask::state::{AskAgentConfig, AskAnswer, AskOutcome, AskPhase, AskState, ChunkSet, Verdict};
use crate::core::ActivityError;
use crate::index::{RetrievedChunk, Retriever};
use crate::llm::LlmClient;
use crate::runtime::ActivityRuntime;

/// 改写提示中最多列出的不相关片段数
const MAX_IRRELEVANT_SNIPPETS: usize = 5;

pub struct AskEngine {
    retriever: Arc<dyn Retriever>,
    runtime: ActivityRuntime,
    grader: Grader,
    generator: AnswerGenerator,
    rewriter: QueryRewriter,
    config: AskAgentConfig,
    event_tx: Option<mpsc::UnboundedSender<AskEvent>>,
}

impl AskEngine {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        llm: Option<Arc<dyn LlmClient>>,
        runtime: ActivityRuntime,
        config: AskAgentConfig,
    ) -> Self {
        Self {
            grader: Grader::new(runtime.clone(), llm.clone(), &config),
            generator: AnswerGenerator::new(runtime.clone(), llm.clone(), config.temperature),
            rewriter: QueryRewriter::new(runtime.clone(), llm, config.temperature),
            retriever,
            runtime,
            config,
            event_tx: None,
        }
    }

    /// 设置进度事件通道
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<AskEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AskAgentConfig {
        &self.config
    }

    fn emit(&self, ev: AskEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn step(&self, state: &mut AskState, n: u32, phase: AskPhase, verdict: Option<Verdict>, detail: String) {
        tracing::debug!(step = n, state = phase.as_str(), query = %state.active_query, %detail, "ask transition");
        self.emit(AskEvent::Step {
            step: n,
            state: phase,
            query: state.active_query.clone(),
            detail: detail.clone(),
        });
        state.record(phase, verdict, detail);
    }

    /// 运行到 finish；检索在重试后仍失败时返回错误，生成失败则走片段回退
    pub async fn run(&self, question: &str) -> Result<AskAnswer, ActivityError> {
        let mut state = AskState::new(question);
        if state.original_query.is_empty() {
            return Err(ActivityError::Rejected("question is empty".to_string()));
        }
        let budget = self.config.reflection_budget();
        let limit = self.config.transition_limit();
        let mut phase = AskPhase::Analyze;
        let mut outcome = AskOutcome::Satisfied;
        let mut n: u32 = 0;

        tracing::info!(question = %state.original_query, budget, "ask started");

        loop {
            n += 1;
            if n > limit {
                tracing::warn!(limit, "ask transition limit reached, finishing");
                if state.draft.is_none() {
                    let draft = fallback_answer(&state.context_chunks(self.config.top_k));
                    state.citations_count = draft.citations.len();
                    state.citations = draft.citations;
                    state.draft = Some(draft.answer);
                }
                outcome = AskOutcome::Exhausted;
                self.step(&mut state, n, AskPhase::Finish, None, "transition limit reached".to_string());
                break;
            }

            match phase {
                AskPhase::Analyze => {
                    state.sub_questions = split_subquestions(&state.original_query, self.config.max_subquestions);
                    let detail = format!(
                        "{} sub-question(s): {}",
                        state.sub_questions.len(),
                        state.sub_questions.join(" | ")
                    );
                    self.step(&mut state, n, phase, None, detail);
                    phase = AskPhase::Retrieve;
                }
                AskPhase::Retrieve => {
                    let (added, total) = self.retrieve(&mut state).await?;
                    self.step(
                        &mut state,
                        n,
                        phase,
                        None,
                        format!("{added} new chunk(s), {total} retrieved in total"),
                    );
                    phase = AskPhase::GradeDocuments;
                }
                AskPhase::GradeDocuments => {
                    for chunk in state.ungraded() {
                        let key = chunk.key();
                        if self.grader.grade_document(&state.active_query, &chunk).await {
                            state.relevant.push(key);
                        } else {
                            state.irrelevant.insert(key);
                        }
                    }
                    let relevant = state.relevant.len();
                    let required = self.config.relevance_threshold();
                    let verdict = if relevant >= required {
                        Verdict::Relevant { relevant }
                    } else {
                        Verdict::Insufficient { relevant, required }
                    };
                    let detail = verdict.describe();
                    phase = if verdict.is_pass() {
                        AskPhase::Generate
                    } else {
                        AskPhase::Rewrite
                    };
                    self.step(&mut state, n, AskPhase::GradeDocuments, Some(verdict), detail);
                }
                AskPhase::Rewrite => {
                    if state.reflections_done >= budget {
                        let from_answer = matches!(state.last_verdict(), Some(Verdict::Rejected { .. }));
                        let detail = if from_answer {
                            "reflection budget spent, keeping best-effort answer"
                        } else {
                            "reflection budget spent, generating from best chunks"
                        };
                        self.step(&mut state, n, phase, None, detail.to_string());
                        if from_answer {
                            outcome = AskOutcome::Exhausted;
                            phase = AskPhase::Finish;
                        } else {
                            phase = AskPhase::Generate;
                        }
                        continue;
                    }
                    state.reflections_done += 1;
                    state.expand_neighbors = true;
                    let snippets = state.irrelevant_snippets(MAX_IRRELEVANT_SNIPPETS);
                    let query = self
                        .rewriter
                        .rewrite(&state.original_query, state.last_verdict(), &snippets)
                        .await;
                    state.sub_questions = followup_queries(&state.original_query, &query);
                    state.active_query = query;
                    let detail = format!("reflection {}/{}", state.reflections_done, budget);
                    self.step(&mut state, n, phase, None, detail);
                    phase = AskPhase::Retrieve;
                }
                AskPhase::Generate => {
                    let chunks = state.context_chunks(self.config.top_k);
                    match self.generator.generate(&state.original_query, &chunks).await {
                        Ok(draft) => {
                            state.citations_count = draft.citations.len();
                            state.citations = draft.citations;
                            state.draft = Some(draft.answer);
                            let detail = format!(
                                "draft from {} chunk(s) with {} citation(s)",
                                chunks.len(),
                                state.citations_count
                            );
                            self.step(&mut state, n, phase, None, detail);
                            phase = AskPhase::GradeAnswer;
                        }
                        Err(cause) => {
                            tracing::warn!(error = %cause, "generation unavailable, returning snippets");
                            let draft = fallback_answer(&chunks);
                            state.citations_count = draft.citations.len();
                            state.citations = draft.citations;
                            state.draft = Some(draft.answer);
                            self.emit(AskEvent::Fallback {
                                reason: cause.0.clone(),
                            });
                            self.step(&mut state, n, phase, None, format!("fallback to snippets: {cause}"));
                            outcome = AskOutcome::Fallback;
                            phase = AskPhase::Finish;
                        }
                    }
                }
                AskPhase::GradeAnswer => {
                    let answer = state.draft.clone().unwrap_or_default();
                    let verdict = self
                        .grader
                        .grade_answer(&state.original_query, &answer, state.citations_count)
                        .await;
                    let detail = verdict.describe();
                    phase = if verdict.is_pass() {
                        AskPhase::Finish
                    } else {
                        AskPhase::Rewrite
                    };
                    self.step(&mut state, n, AskPhase::GradeAnswer, Some(verdict), detail);
                }
                AskPhase::Finish => {
                    self.step(&mut state, n, phase, None, format!("outcome {}", outcome.as_str()));
                    break;
                }
            }
        }

        let answer = AskAnswer {
            answer: state.draft.take().unwrap_or_default(),
            citations: std::mem::take(&mut state.citations),
            reasoning_trace: std::mem::take(&mut state.trace),
            reflections_done: state.reflections_done,
            outcome,
        };
        self.emit(AskEvent::Finished {
            outcome,
            citations: answer.citations.len(),
            reflections: answer.reflections_done,
        });
        tracing::info!(
            outcome = outcome.as_str(),
            reflections = answer.reflections_done,
            citations = answer.citations.len(),
            "ask finished"
        );
        Ok(answer)
    }

    /// 每个查询取回一轮结果，按身份合并后按来源限额重排；已判为不相关的 chunk 被过滤，因此多取相应数量
    async fn retrieve(&self, state: &mut AskState) -> Result<(usize, usize), ActivityError> {
        let retriever = self.retriever.as_ref();
        let fetch = self.config.top_k + state.irrelevant.len();
        let mut round = ChunkSet::new();
        for query in &state.sub_questions {
            let query = query.as_str();
            let hits = self
                .runtime
                .execute("retrieve", || async move { retriever.query(query, fetch).await })
                .await?;
            for hit in hits
                .into_iter()
                .filter(|h| !state.irrelevant.contains(&h.key()))
                .take(self.config.top_k)
            {
                round.insert(hit);
            }
        }

        let ranked = rerank_by_source(round.iter().cloned().collect(), self.config.max_per_source());
        let mut added = 0;
        for hit in ranked {
            if state.retrieved_chunks.insert(hit) {
                added += 1;
            }
        }

        if state.expand_neighbors && self.config.neighbor_span > 0 {
            added += self.expand_neighbors(state).await?;
        }
        state.expand_neighbors = false;
        Ok((added, state.retrieved_chunks.len()))
    }

    async fn expand_neighbors(&self, state: &mut AskState) -> Result<usize, ActivityError> {
        let span = i64::from(self.config.neighbor_span);
        let offsets: BTreeSet<i64> = (1..=span).flat_map(|o| [-o, o]).collect();
        let retriever = self.retriever.as_ref();
        let mut added = 0;

        for key in state.relevant.clone() {
            let Some(chunk) = state.retrieved_chunks.get_mut(&key) else {
                continue;
            };
            chunk.chunk.neighbor_offsets.extend(offsets.iter().copied());
            let anchor: RetrievedChunk = chunk.clone();
            let (anchor, offsets) = (&anchor, &offsets);
            let neighbors = self
                .runtime
                .execute("neighbors", || async move { retriever.neighbors(anchor, offsets).await })
                .await?;
            for neighbor in neighbors {
                if state.retrieved_chunks.insert(neighbor) {
                    added += 1;
                }
            }
        }
        Ok(added)
    }
}
