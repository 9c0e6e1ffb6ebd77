//! 向量索引：chunk 标识、检索接口与持久化存储
//!
//! - [`ChunkRef`]：以 (document_fingerprint, chunk_id) 为标识，neighbor_offsets 不参与比较
//! - [`Retriever`]：问答引擎看到的检索接口（query / neighbors）
//! - [`VectorStore`]：SQLite 持久化 + 不可变内存快照，提交时整体替换快照

pub mod store;
pub mod tokenizer;

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ActivityError;

pub use store::{CommitOutcome, DocumentRecord, IndexSnapshot, NewChunk, SnapshotRetriever, VectorStore};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored embedding is unreadable: {0}")]
    Corrupted(String),

    #[error("index lock poisoned")]
    Poisoned,
}

impl From<IndexError> for ActivityError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Corrupted(msg) => ActivityError::Rejected(msg),
            other => ActivityError::Transient(other.to_string()),
        }
    }
}

/// chunk 的身份
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub document_fingerprint: String,
    pub chunk_id: String,
}

/// chunk 引用；相等与哈希只看身份
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkRef {
    pub document_fingerprint: String,
    pub chunk_id: String,
    #[serde(default)]
    pub neighbor_offsets: BTreeSet<i64>,
}

impl ChunkRef {
    pub fn new(document_fingerprint: impl Into<String>, chunk_id: impl Into<String>) -> Self {
        Self {
            document_fingerprint: document_fingerprint.into(),
            chunk_id: chunk_id.into(),
            neighbor_offsets: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> ChunkKey {
        ChunkKey {
            document_fingerprint: self.document_fingerprint.clone(),
            chunk_id: self.chunk_id.clone(),
        }
    }
}

impl PartialEq for ChunkRef {
    fn eq(&self, other: &Self) -> bool {
        self.document_fingerprint == other.document_fingerprint && self.chunk_id == other.chunk_id
    }
}

impl Eq for ChunkRef {}

impl Hash for ChunkRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.document_fingerprint.hash(state);
        self.chunk_id.hash(state);
    }
}

/// 检索命中
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: ChunkRef,
    /// 在文档内的顺序号，用于取相邻 chunk
    pub ordinal: usize,
    /// 来源文件名
    pub source: String,
    pub text: String,
    pub score: f32,
}

impl RetrievedChunk {
    pub fn key(&self) -> ChunkKey {
        self.chunk.key()
    }

    /// 引用时展示的位置，如 `policy.md#policy-chunk-0002`
    pub fn location(&self) -> String {
        format!("{}#{}", self.source, self.chunk.chunk_id)
    }
}

/// 问答引擎依赖的检索接口
#[async_trait]
pub trait Retriever: Send + Sync {
    /// 按相关度返回最多 top_k 个 chunk
    async fn query(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, ActivityError>;

    /// 取同一文档内 ordinal + offset 处的 chunk；越界的偏移被忽略
    async fn neighbors(
        &self,
        chunk: &RetrievedChunk,
        offsets: &BTreeSet<i64>,
    ) -> Result<Vec<RetrievedChunk>, ActivityError>;
}

/// 单个来源的统计
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub source: String,
    pub document_type: String,
    pub chunks: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub sources: Vec<SourceStats>,
    pub last_indexed_at: Option<String>,
}

impl IndexStats {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Vector index statistics\n  Documents: {}\n  Chunks: {}\n  Embedded chunks: {}\n  Last indexed: {}",
            self.documents,
            self.chunks,
            self.embedded_chunks,
            self.last_indexed_at.as_deref().unwrap_or("never"),
        );
        if !self.sources.is_empty() {
            out.push_str("\n  Sources:");
            for s in &self.sources {
                out.push_str(&format!(
                    "\n    - {} [{}] ({} chunks)",
                    s.source, s.document_type, s.chunks
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_chunk_identity_ignores_neighbor_offsets() {
        let a = ChunkRef::new("fp", "doc-chunk-0001");
        let mut b = a.clone();
        b.neighbor_offsets.insert(1);
        assert_eq!(a, b);
        let set: HashSet<ChunkRef> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
        assert_ne!(ChunkRef::new("fp", "x"), ChunkRef::new("other", "x"));
    }

    #[test]
    fn test_stats_render_lists_sources() {
        let stats = IndexStats {
            documents: 1,
            chunks: 3,
            embedded_chunks: 0,
            sources: vec![SourceStats {
                source: "policy.md".into(),
                document_type: "markdown".into(),
                chunks: 3,
            }],
            last_indexed_at: None,
        };
        let text = stats.render();
        assert!(text.contains("Documents: 1"));
        assert!(text.contains("policy.md [markdown] (3 chunks)"));
        assert!(text.contains("Last indexed: never"));
    }
}
