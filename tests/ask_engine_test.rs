//! 检索-反思引擎集成测试

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use rag0::ask::{AskAgentConfig, AskEngine, AskOutcome, AskPhase};
use rag0::core::ActivityError;
use rag0::index::{ChunkRef, RetrievedChunk, Retriever};
use rag0::llm::{LlmClient, LlmError, Message, MockLlmClient, Role};
use rag0::runtime::ActivityRuntime;

const REFUND_TEXT: &str = "Refunds are accepted within a 30 day refund window. Items must be unused.";
const CAFETERIA_TEXT: &str = "The office cafeteria opens at nine and serves lunch until two.";

fn chunk(fingerprint: &str, id: &str, text: &str, score: f32) -> RetrievedChunk {
    RetrievedChunk {
        chunk: ChunkRef::new(fingerprint, id),
        ordinal: 0,
        source: format!("{fingerprint}.md"),
        text: text.to_string(),
        score,
    }
}

/// 原始问题只命中无关片段，带 policy 的改写查询命中退款条款
struct PolicyRetriever;

#[async_trait]
impl Retriever for PolicyRetriever {
    async fn query(&self, query: &str, _top_k: usize) -> Result<Vec<RetrievedChunk>, ActivityError> {
        if query.contains("policy") {
            Ok(vec![chunk("refunds", "refunds-chunk-0000", REFUND_TEXT, 0.9)])
        } else {
            Ok(vec![chunk("office", "office-chunk-0000", CAFETERIA_TEXT, 0.4)])
        }
    }

    async fn neighbors(
        &self,
        _chunk: &RetrievedChunk,
        _offsets: &BTreeSet<i64>,
    ) -> Result<Vec<RetrievedChunk>, ActivityError> {
        Ok(Vec::new())
    }
}

/// 每轮都返回同样两个 chunk
struct SameHits(Vec<RetrievedChunk>);

#[async_trait]
impl Retriever for SameHits {
    async fn query(&self, _query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, ActivityError> {
        Ok(self.0.iter().take(top_k).cloned().collect())
    }

    async fn neighbors(
        &self,
        _chunk: &RetrievedChunk,
        _offsets: &BTreeSet<i64>,
    ) -> Result<Vec<RetrievedChunk>, ActivityError> {
        Ok(Vec::new())
    }
}

/// 改写请求返回固定查询，其余交给 MockLlmClient
struct PolicyRewriteLlm;

#[async_trait]
impl LlmClient for PolicyRewriteLlm {
    async fn complete(&self, messages: &[Message], temperature: f32) -> Result<String, LlmError> {
        let rewriting = messages
            .iter()
            .any(|m| m.role == Role::System && m.content.contains("rewrite search queries"));
        if rewriting {
            return Ok("refund window policy".to_string());
        }
        MockLlmClient.complete(messages, temperature).await
    }
}

fn engine(retriever: Arc<dyn Retriever>, llm: Arc<dyn LlmClient>, config: AskAgentConfig) -> AskEngine {
    AskEngine::new(retriever, Some(llm), ActivityRuntime::default(), config)
}

#[tokio::test]
async fn test_refund_window_needs_one_reflection() {
    let config = AskAgentConfig {
        top_k: 4,
        max_reflections: 2,
        min_citations: 1,
        ..AskAgentConfig::default()
    };
    let engine = engine(Arc::new(PolicyRetriever), Arc::new(PolicyRewriteLlm), config);

    let answer = engine.run("What is the refund window?").await.unwrap();
    assert_eq!(answer.outcome, AskOutcome::Satisfied);
    assert_eq!(answer.reflections_done, 1);
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citation_refs(), vec![ChunkRef::new("refunds", "refunds-chunk-0000")]);
    assert!(answer.answer.contains("30 day refund window"));

    let states: Vec<AskPhase> = answer.reasoning_trace.iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![
            AskPhase::Analyze,
            AskPhase::Retrieve,
            AskPhase::GradeDocuments,
            AskPhase::Rewrite,
            AskPhase::Retrieve,
            AskPhase::GradeDocuments,
            AskPhase::Generate,
            AskPhase::GradeAnswer,
            AskPhase::Finish,
        ]
    );
    assert_eq!(answer.reasoning_trace[4].query, "refund window policy");

    let rendered = answer.render();
    assert!(rendered.contains("[1] refunds.md#refunds-chunk-0000"));
}

#[tokio::test]
async fn test_repeated_hits_are_not_duplicated() {
    let hits = vec![
        chunk("refunds", "refunds-chunk-0000", REFUND_TEXT, 0.9),
        chunk("office", "office-chunk-0000", CAFETERIA_TEXT, 0.3),
    ];
    let config = AskAgentConfig {
        top_k: 4,
        max_reflections: 2,
        min_citations: 2,
        ..AskAgentConfig::default()
    };
    let engine = engine(Arc::new(SameHits(hits)), Arc::new(MockLlmClient), config);

    let answer = engine.run("How long is the refund window?").await.unwrap();
    assert_eq!(answer.reflections_done, 2);
    assert_eq!(answer.outcome, AskOutcome::Exhausted);

    let cited: HashSet<_> = answer.citations.iter().map(|c| c.chunk.key()).collect();
    assert_eq!(cited.len(), answer.citations.len());
    assert_eq!(answer.citations.len(), 1);

    let retrieves: Vec<&str> = answer
        .reasoning_trace
        .iter()
        .filter(|s| s.state == AskPhase::Retrieve)
        .map(|s| s.detail.as_str())
        .collect();
    assert_eq!(retrieves.len(), 3);
    assert_eq!(retrieves[0], "2 new chunk(s), 2 retrieved in total");
    assert!(retrieves[1..]
        .iter()
        .all(|d| *d == "0 new chunk(s), 2 retrieved in total"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_reflections_stay_within_budget(
        max_reflections in 0u32..4,
        reflection_enabled in any::<bool>(),
        min_citations in 0usize..3,
        with_hits in any::<bool>(),
    ) {
        let hits = if with_hits {
            vec![chunk("office", "office-chunk-0000", CAFETERIA_TEXT, 0.4)]
        } else {
            Vec::new()
        };
        let config = AskAgentConfig {
            top_k: 3,
            max_reflections,
            min_citations,
            reflection_enabled,
            ..AskAgentConfig::default()
        };
        let budget = config.reflection_budget();
        let engine = engine(Arc::new(SameHits(hits)), Arc::new(MockLlmClient), config);

        let rt = tokio::runtime::Runtime::new().unwrap();
        let answer = rt.block_on(engine.run("What is the refund window?")).unwrap();

        prop_assert!(answer.reflections_done <= max_reflections);
        prop_assert!(answer.reflections_done <= budget);
        let retrieves = answer
            .reasoning_trace
            .iter()
            .filter(|s| s.state == AskPhase::Retrieve)
            .count() as u32;
        prop_assert_eq!(retrieves, answer.reflections_done + 1);
        if budget == 0 {
            prop_assert_eq!(retrieves, 1);
        }
        prop_assert_eq!(answer.reasoning_trace.last().map(|s| s.state), Some(AskPhase::Finish));
    }
}
