//! 子执行：编排器启动并等待的长任务（ingest / ask）与本地活动（stats）
//!
//! [`ChildWorkflows`] 是编排器看到的接口；[`WorkflowHost`] 把它绑定到活动运行时、向量索引与 LLM。
//! 子执行必须可重放：进程重启后编排器会以同一个 child_id 重新启动它。

pub mod host;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ask::{AskAnswer, AskEvent, AskRequest};
use crate::core::ActivityError;
use crate::index::IndexStats;
use crate::ingest::{IngestReport, IngestRequest};

pub use host::WorkflowHost;

#[async_trait]
pub trait ChildWorkflows: Send + Sync {
    async fn ingest(&self, child_id: &str, request: IngestRequest) -> Result<IngestReport, ActivityError>;

    /// events 为可选的进度通道；问答在启动时绑定索引快照
    async fn ask(
        &self,
        child_id: &str,
        request: AskRequest,
        events: Option<mpsc::UnboundedSender<AskEvent>>,
    ) -> Result<AskAnswer, ActivityError>;

    async fn stats(&self) -> Result<IndexStats, ActivityError>;
}
