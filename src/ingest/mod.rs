//! 文档摄取流水线：detect → parse → chunk → persist → embed → index
//!
//! 每一步都是幂等活动，经 [`ActivityRuntime`] 执行（超时、重试、审计日志）。
//! 文档以内容 SHA-256 作为指纹，已在索引中的指纹直接返回 `already_indexed`。

pub mod chunking;
pub mod detector;
pub mod storage;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{AppConfig, IngestSection};
use crate::core::ActivityError;
use crate::index::{CommitOutcome, DocumentRecord, NewChunk, VectorStore};
use crate::llm::EmbeddingProvider;
use crate::runtime::ActivityRuntime;

pub use chunking::{Chunk, Chunker, ChunkingConfig};
pub use detector::{detect_document_type, DocumentType};
pub use storage::{store_parsed_markdown, ParsedMetadata, StoredPaths};

/// 编排器发给摄取子执行的请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub payload_reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Indexed,
    AlreadyIndexed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub status: IngestStatus,
    pub document_fingerprint: String,
    pub chunks_indexed: usize,
    pub document_type: DocumentType,
    pub source_path: String,
    pub parsed_path: Option<String>,
}

impl IngestReport {
    pub fn render(&self) -> String {
        let headline = match self.status {
            IngestStatus::Indexed => format!("Ingested {}", self.source_path),
            IngestStatus::AlreadyIndexed => format!("Already indexed: {}", self.source_path),
        };
        let mut out = format!(
            "{headline}\n  Type: {}\n  Fingerprint: {}\n  Chunks: {}",
            self.document_type.as_str(),
            self.document_fingerprint,
            self.chunks_indexed
        );
        if let Some(parsed) = &self.parsed_path {
            out.push_str(&format!("\n  Parsed: {parsed}"));
        }
        out
    }
}

struct ParsedDocument {
    markdown: String,
    fingerprint: String,
    size_bytes: u64,
}

/// 摄取流水线
pub struct IngestionPipeline {
    runtime: ActivityRuntime,
    store: Arc<VectorStore>,
    chunker: Chunker,
    parsed_dir: PathBuf,
    embed_concurrency: usize,
}

impl IngestionPipeline {
    pub fn new(
        runtime: ActivityRuntime,
        store: Arc<VectorStore>,
        ingest: &IngestSection,
        parsed_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            store,
            chunker: Chunker::new(ChunkingConfig::from_section(ingest)),
            parsed_dir: parsed_dir.into(),
            embed_concurrency: ingest.embed_concurrency.max(1),
        }
    }

    pub fn from_config(runtime: ActivityRuntime, store: Arc<VectorStore>, cfg: &AppConfig) -> Self {
        Self::new(runtime, store, &cfg.ingest, cfg.app.parsed_dir.clone())
    }

    pub async fn run(&self, request: &IngestRequest) -> Result<IngestReport, ActivityError> {
        let path = PathBuf::from(request.payload_reference.trim());
        let source_path = path
            .canonicalize()
            .unwrap_or_else(|_| path.clone())
            .display()
            .to_string();

        let document_type = {
            let path = path.clone();
            self.runtime
                .execute_blocking("detect", move || detect_document_type(&path))
                .await?
        };
        tracing::info!(path = %source_path, document_type = document_type.as_str(), "document detected");

        let parsed = {
            let path = path.clone();
            self.runtime
                .execute_blocking("parse", move || parse_document(&path, document_type))
                .await?
        };

        let snapshot = self.store.snapshot().map_err(ActivityError::from)?;
        if let Some(existing) = snapshot.document(&parsed.fingerprint) {
            tracing::info!(fingerprint = %parsed.fingerprint, "document already indexed");
            return Ok(IngestReport {
                status: IngestStatus::AlreadyIndexed,
                document_fingerprint: parsed.fingerprint.clone(),
                chunks_indexed: existing.chunk_count,
                document_type,
                source_path,
                parsed_path: None,
            });
        }

        let stem = file_stem(&path);
        let chunks = self.chunker.chunk(&stem, &parsed.markdown);
        if chunks.is_empty() {
            return Err(ActivityError::Rejected(format!(
                "{source_path} contains no text to index"
            )));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| stem.clone());
        let metadata = ParsedMetadata {
            file_name: file_name.clone(),
            source_path: source_path.clone(),
            document_type: document_type.as_str().to_string(),
            fingerprint: parsed.fingerprint.clone(),
            size_bytes: parsed.size_bytes,
            parsed_at: chrono::Utc::now().to_rfc3339(),
            paragraphs: parsed.markdown.split("\n\n").filter(|p| !p.trim().is_empty()).count(),
        };
        let stored = {
            let parsed_dir = self.parsed_dir.clone();
            let markdown = parsed.markdown.clone();
            let stem = stem.clone();
            self.runtime
                .execute_blocking("persist", move || {
                    store_parsed_markdown(&parsed_dir, &stem, &markdown, &metadata)
                })
                .await?
        };

        let embeddings = match self.store.embedder() {
            Some(embedder) => self.embed_chunks(embedder, &chunks).await?,
            None => vec![None; chunks.len()],
        };

        let new_chunks: Vec<NewChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(c, embedding)| NewChunk {
                chunk_id: c.chunk_id,
                ordinal: c.ordinal,
                text: c.text,
                embedding,
            })
            .collect();
        let record = DocumentRecord {
            fingerprint: parsed.fingerprint.clone(),
            source: file_name,
            source_path: source_path.clone(),
            document_type: document_type.as_str().to_string(),
            chunk_count: new_chunks.len(),
            indexed_at: chrono::Utc::now().to_rfc3339(),
        };
        let outcome = {
            let store = self.store.clone();
            self.runtime
                .execute_blocking("index", move || {
                    store.commit_document(record, new_chunks).map_err(ActivityError::from)
                })
                .await?
        };

        let (status, chunks_indexed) = match outcome {
            CommitOutcome::Indexed { chunks } => (IngestStatus::Indexed, chunks),
            CommitOutcome::AlreadyIndexed { chunks } => (IngestStatus::AlreadyIndexed, chunks),
        };
        Ok(IngestReport {
            status,
            document_fingerprint: parsed.fingerprint,
            chunks_indexed,
            document_type,
            source_path,
            parsed_path: Some(stored.markdown_path.display().to_string()),
        })
    }

    async fn embed_chunks(
        &self,
        embedder: Arc<dyn EmbeddingProvider>,
        chunks: &[Chunk],
    ) -> Result<Vec<Option<Vec<f32>>>, ActivityError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let runtime = self.runtime.clone();
        stream::iter(texts)
            .map(move |text| {
                let runtime = runtime.clone();
                let embedder = embedder.clone();
                async move {
                    runtime
                        .execute("embed", move || {
                            let embedder = embedder.clone();
                            let text = text.clone();
                            async move { embedder.embed(&text).await.map_err(ActivityError::from) }
                        })
                        .await
                        .map(|v| (!v.is_empty()).then_some(v))
                }
            })
            .buffered(self.embed_concurrency)
            .try_collect()
            .await
    }
}

/// 解析活动：文本类文件原样读取，其余类型需要外部抽取能力
fn parse_document(path: &Path, document_type: DocumentType) -> Result<ParsedDocument, ActivityError> {
    if !document_type.is_plain_text() {
        return Err(ActivityError::Rejected(format!(
            "text extraction for {} documents is not available",
            document_type.as_str()
        )));
    }
    let bytes = std::fs::read(path)
        .map_err(|e| ActivityError::Transient(format!("read {}: {}", path.display(), e)))?;
    let fingerprint = fingerprint(&bytes);
    let markdown = String::from_utf8(bytes)
        .map_err(|_| ActivityError::Rejected(format!("{} is not valid UTF-8", path.display())))?;
    Ok(ParsedDocument {
        size_bytes: markdown.len() as u64,
        markdown,
        fingerprint,
    })
}

/// 内容指纹（SHA-256 十六进制）
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn file_stem(path: &Path) -> String {
    let stem: String = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "document".to_string()
    } else {
        stem
    }
}
