//! 子执行宿主

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ask::{AskAnswer, AskEngine, AskEvent, AskRequest};
use crate::config::AppConfig;
use crate::core::ActivityError;
use crate::index::{IndexStats, VectorStore};
use crate::ingest::{IngestReport, IngestRequest, IngestionPipeline};
use crate::llm::LlmClient;
use crate::runtime::ActivityRuntime;
use crate::workflow::ChildWorkflows;

pub struct WorkflowHost {
    runtime: ActivityRuntime,
    store: Arc<VectorStore>,
    llm: Option<Arc<dyn LlmClient>>,
    ingestion: IngestionPipeline,
}

impl WorkflowHost {
    pub fn new(
        runtime: ActivityRuntime,
        store: Arc<VectorStore>,
        llm: Option<Arc<dyn LlmClient>>,
        ingestion: IngestionPipeline,
    ) -> Self {
        Self {
            runtime,
            store,
            llm,
            ingestion,
        }
    }

    pub fn from_config(cfg: &AppConfig, store: Arc<VectorStore>, llm: Option<Arc<dyn LlmClient>>) -> Self {
        let runtime = ActivityRuntime::from_config(&cfg.runtime);
        let ingestion = IngestionPipeline::from_config(runtime.clone(), store.clone(), cfg);
        Self::new(runtime, store, llm, ingestion)
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// LLM 累计 token 用量 (prompt, completion, total)；没有 LLM 时为 0
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.as_ref().map_or((0, 0, 0), |llm| llm.token_usage())
    }
}

#[async_trait]
impl ChildWorkflows for WorkflowHost {
    async fn ingest(&self, child_id: &str, request: IngestRequest) -> Result<IngestReport, ActivityError> {
        tracing::info!(child_id, path = %request.payload_reference, "ingest child started");
        let report = self.ingestion.run(&request).await;
        match &report {
            Ok(r) => tracing::info!(child_id, chunks = r.chunks_indexed, "ingest child finished"),
            Err(e) => tracing::warn!(child_id, error = %e, "ingest child failed"),
        }
        report
    }

    async fn ask(
        &self,
        child_id: &str,
        request: AskRequest,
        events: Option<mpsc::UnboundedSender<AskEvent>>,
    ) -> Result<AskAnswer, ActivityError> {
        // 启动时绑定快照，之后提交的文档对本次问答不可见
        let retriever = self.store.retriever().map_err(ActivityError::from)?;
        tracing::info!(
            child_id,
            generation = retriever.snapshot().generation(),
            "ask child started"
        );
        let mut engine = AskEngine::new(
            Arc::new(retriever),
            self.llm.clone(),
            self.runtime.clone(),
            request.config,
        );
        if let Some(tx) = events {
            engine = engine.with_events(tx);
        }
        let before = self.token_usage();
        let answer = engine.run(&request.question).await;
        let after = self.token_usage();
        tracing::info!(
            child_id,
            prompt_tokens = after.0.saturating_sub(before.0),
            completion_tokens = after.1.saturating_sub(before.1),
            total_tokens = after.2.saturating_sub(before.2),
            "ask child token usage"
        );
        answer
    }

    async fn stats(&self) -> Result<IndexStats, ActivityError> {
        let store = self.store.as_ref();
        self.runtime
            .execute("stats", || async move { store.stats().map_err(ActivityError::from) })
            .await
    }
}
