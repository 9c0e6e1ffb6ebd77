//! 向量存储
//!
//! 文档与 chunk 持久化在 SQLite 中，启动时整体载入为不可变的 [`IndexSnapshot`]。
//! 提交新文档时先在一个事务里写库，再用新快照替换旧快照；已经拿到旧快照的读者不受影响。
//! 检索：关键词得分；有嵌入时与余弦相似度做 RRF（k = 60）融合。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::ActivityError;
use crate::index::tokenizer::{content_terms, keyword_score};
use crate::index::{ChunkRef, IndexError, IndexStats, RetrievedChunk, Retriever, SourceStats};
use crate::llm::EmbeddingProvider;

const RRF_K: f32 = 60.0;

/// 待写入的 chunk
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_id: String,
    pub ordinal: usize,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
}

/// 文档元数据
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub fingerprint: String,
    pub source: String,
    pub source_path: String,
    pub document_type: String,
    pub chunk_count: usize,
    pub indexed_at: String,
}

#[derive(Debug, Clone)]
struct StoredChunk {
    fingerprint: String,
    chunk_id: String,
    ordinal: usize,
    source: String,
    text: String,
    embedding: Option<Vec<f32>>,
    terms: HashSet<String>,
}

impl StoredChunk {
    fn to_retrieved(&self, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk: ChunkRef::new(&self.fingerprint, &self.chunk_id),
            ordinal: self.ordinal,
            source: self.source.clone(),
            text: self.text.clone(),
            score,
        }
    }
}

/// 索引在某一时刻的完整只读视图
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    generation: u64,
    documents: Vec<DocumentRecord>,
    chunks: Vec<StoredChunk>,
    by_position: HashMap<(String, usize), usize>,
}

impl IndexSnapshot {
    fn build(generation: u64, documents: Vec<DocumentRecord>, chunks: Vec<StoredChunk>) -> Self {
        let by_position = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| ((c.fingerprint.clone(), c.ordinal), i))
            .collect();
        Self {
            generation,
            documents,
            chunks,
            by_position,
        }
    }

    /// 每次提交加一
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.documents.iter().any(|d| d.fingerprint == fingerprint)
    }

    pub fn document(&self, fingerprint: &str) -> Option<&DocumentRecord> {
        self.documents.iter().find(|d| d.fingerprint == fingerprint)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            documents: self.documents.len(),
            chunks: self.chunks.len(),
            embedded_chunks: self.chunks.iter().filter(|c| c.embedding.is_some()).count(),
            sources: self
                .documents
                .iter()
                .map(|d| SourceStats {
                    source: d.source.clone(),
                    document_type: d.document_type.clone(),
                    chunks: d.chunk_count,
                })
                .collect(),
            last_indexed_at: self.documents.iter().map(|d| d.indexed_at.clone()).max(),
        }
    }

    fn keyword_ranking(&self, query: &str) -> Vec<(usize, f32)> {
        let terms = content_terms(query);
        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, keyword_score(&terms, &c.terms)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        self.sort_ranking(&mut scored);
        scored
    }

    fn vector_ranking(&self, query_embedding: &[f32]) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.embedding
                    .as_deref()
                    .map(|e| (i, cosine_similarity(query_embedding, e)))
            })
            .filter(|(_, s)| *s > 0.0)
            .collect();
        self.sort_ranking(&mut scored);
        scored
    }

    /// 分数降序；同分按 (文档, 顺序号) 升序，保证结果确定
    fn sort_ranking(&self, scored: &mut [(usize, f32)]) {
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let (ca, cb) = (&self.chunks[a.0], &self.chunks[b.0]);
                    (&ca.fingerprint, ca.ordinal).cmp(&(&cb.fingerprint, cb.ordinal))
                })
        });
    }

    /// 检索；query_embedding 为 None 时只用关键词
    pub fn search(&self, query: &str, query_embedding: Option<&[f32]>, top_k: usize) -> Vec<RetrievedChunk> {
        let keyword = self.keyword_ranking(query);
        let ranking = match query_embedding {
            Some(qe) if !qe.is_empty() => {
                let vector = self.vector_ranking(qe);
                let mut fused: HashMap<usize, f32> = HashMap::new();
                for list in [&vector, &keyword] {
                    for (rank, (idx, _)) in list.iter().take(top_k * 2).enumerate() {
                        *fused.entry(*idx).or_insert(0.0) += 1.0 / (RRF_K + rank as f32);
                    }
                }
                let mut fused: Vec<(usize, f32)> = fused.into_iter().collect();
                self.sort_ranking(&mut fused);
                fused
            }
            _ => keyword,
        };
        ranking
            .into_iter()
            .take(top_k)
            .map(|(idx, score)| self.chunks[idx].to_retrieved(score))
            .collect()
    }

    pub fn neighbors_of(&self, chunk: &RetrievedChunk, offsets: &BTreeSet<i64>) -> Vec<RetrievedChunk> {
        offsets
            .iter()
            .filter(|o| **o != 0)
            .filter_map(|o| {
                let ordinal = chunk.ordinal as i64 + o;
                if ordinal < 0 {
                    return None;
                }
                self.by_position
                    .get(&(chunk.chunk.document_fingerprint.clone(), ordinal as usize))
                    .map(|idx| self.chunks[*idx].to_retrieved(0.0))
            })
            .collect()
    }
}

/// 余弦相似度
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// 提交结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Indexed { chunks: usize },
    /// 同一指纹已在索引中，未做任何修改
    AlreadyIndexed { chunks: usize },
}

/// 向量存储
pub struct VectorStore {
    conn: Mutex<Connection>,
    current: RwLock<Arc<IndexSnapshot>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl VectorStore {
    pub fn open(path: impl AsRef<Path>, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?, embedder)
    }

    pub fn open_in_memory(embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self, IndexError> {
        Self::init(Connection::open_in_memory()?, embedder)
    }

    fn init(conn: Connection, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Result<Self, IndexError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                fingerprint   TEXT PRIMARY KEY,
                source        TEXT NOT NULL,
                source_path   TEXT NOT NULL,
                document_type TEXT NOT NULL,
                chunk_count   INTEGER NOT NULL,
                indexed_at    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chunks (
                fingerprint TEXT NOT NULL,
                chunk_id    TEXT NOT NULL,
                ordinal     INTEGER NOT NULL,
                text        TEXT NOT NULL,
                embedding   TEXT,
                PRIMARY KEY (fingerprint, chunk_id)
            );
            "#,
        )?;
        let snapshot = Self::load(&conn)?;
        tracing::info!(
            documents = snapshot.documents.len(),
            chunks = snapshot.chunks.len(),
            "vector index loaded"
        );
        Ok(Self {
            conn: Mutex::new(conn),
            current: RwLock::new(Arc::new(snapshot)),
            embedder,
        })
    }

    fn load(conn: &Connection) -> Result<IndexSnapshot, IndexError> {
        let mut stmt = conn.prepare(
            "SELECT fingerprint, source, source_path, document_type, chunk_count, indexed_at
             FROM documents ORDER BY indexed_at, fingerprint",
        )?;
        let documents = stmt
            .query_map([], |row| {
                Ok(DocumentRecord {
                    fingerprint: row.get(0)?,
                    source: row.get(1)?,
                    source_path: row.get(2)?,
                    document_type: row.get(3)?,
                    chunk_count: row.get::<_, i64>(4)? as usize,
                    indexed_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let sources: HashMap<&str, &str> = documents
            .iter()
            .map(|d| (d.fingerprint.as_str(), d.source.as_str()))
            .collect();

        let mut stmt = conn.prepare(
            "SELECT fingerprint, chunk_id, ordinal, text, embedding FROM chunks ORDER BY fingerprint, ordinal",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut chunks = Vec::with_capacity(rows.len());
        for (fingerprint, chunk_id, ordinal, text, embedding) in rows {
            let embedding = embedding
                .map(|raw| serde_json::from_str::<Vec<f32>>(&raw))
                .transpose()
                .map_err(|e| IndexError::Corrupted(format!("{chunk_id}: {e}")))?;
            let source = sources.get(fingerprint.as_str()).copied().unwrap_or("").to_string();
            chunks.push(StoredChunk {
                terms: content_terms(&text),
                fingerprint,
                chunk_id,
                ordinal: ordinal as usize,
                source,
                text,
                embedding,
            });
        }
        Ok(IndexSnapshot::build(1, documents, chunks))
    }

    /// 当前快照；调用方持有期间看到的索引内容不变
    pub fn snapshot(&self) -> Result<Arc<IndexSnapshot>, IndexError> {
        self.current
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|_| IndexError::Poisoned)
    }

    /// 绑定当前快照的检索器
    pub fn retriever(&self) -> Result<SnapshotRetriever, IndexError> {
        Ok(SnapshotRetriever {
            snapshot: self.snapshot()?,
            embedder: self.embedder.clone(),
        })
    }

    pub fn embedder(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.embedder.clone()
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        Ok(self.snapshot()?.stats())
    }

    /// 写入一个文档的全部 chunk 并发布新快照；指纹已存在时不做修改
    pub fn commit_document(&self, record: DocumentRecord, chunks: Vec<NewChunk>) -> Result<CommitOutcome, IndexError> {
        let mut conn = self.conn.lock().map_err(|_| IndexError::Poisoned)?;

        let existing: Option<i64> = conn
            .query_row(
                "SELECT chunk_count FROM documents WHERE fingerprint = ?1",
                params![record.fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(count) = existing {
            return Ok(CommitOutcome::AlreadyIndexed {
                chunks: count as usize,
            });
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO documents (fingerprint, source, source_path, document_type, chunk_count, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.fingerprint,
                record.source,
                record.source_path,
                record.document_type,
                chunks.len() as i64,
                record.indexed_at
            ],
        )?;
        for chunk in &chunks {
            let embedding = chunk
                .embedding
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| IndexError::Corrupted(e.to_string()))?;
            tx.execute(
                "INSERT INTO chunks (fingerprint, chunk_id, ordinal, text, embedding) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.fingerprint,
                    chunk.chunk_id,
                    chunk.ordinal as i64,
                    chunk.text,
                    embedding
                ],
            )?;
        }
        tx.commit()?;

        // 在持有写锁期间替换快照，保证提交顺序与快照顺序一致
        let mut current = self.current.write().map_err(|_| IndexError::Poisoned)?;
        let generation = current.generation + 1;
        let mut documents = current.documents.clone();
        let mut stored = current.chunks.clone();
        let count = chunks.len();
        stored.extend(chunks.into_iter().map(|c| StoredChunk {
            terms: content_terms(&c.text),
            fingerprint: record.fingerprint.clone(),
            chunk_id: c.chunk_id,
            ordinal: c.ordinal,
            source: record.source.clone(),
            text: c.text,
            embedding: c.embedding,
        }));
        tracing::info!(
            fingerprint = %record.fingerprint,
            source = %record.source,
            chunks = count,
            "document committed to index"
        );
        documents.push(record);
        *current = Arc::new(IndexSnapshot::build(generation, documents, stored));
        drop(conn);
        Ok(CommitOutcome::Indexed { chunks: count })
    }
}

/// 绑定在某个快照上的检索器（问答子执行开始时创建）
#[derive(Clone)]
pub struct SnapshotRetriever {
    snapshot: Arc<IndexSnapshot>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl SnapshotRetriever {
    pub fn new(snapshot: Arc<IndexSnapshot>, embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self { snapshot, embedder }
    }

    pub fn snapshot(&self) -> &IndexSnapshot {
        &self.snapshot
    }
}

#[async_trait]
impl Retriever for SnapshotRetriever {
    async fn query(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, ActivityError> {
        let has_vectors = self.snapshot.chunks.iter().any(|c| c.embedding.is_some());
        let query_embedding = match &self.embedder {
            Some(embedder) if has_vectors => Some(embedder.embed(query).await?),
            _ => None,
        };
        Ok(self.snapshot.search(query, query_embedding.as_deref(), top_k))
    }

    async fn neighbors(
        &self,
        chunk: &RetrievedChunk,
        offsets: &BTreeSet<i64>,
    ) -> Result<Vec<RetrievedChunk>, ActivityError> {
        Ok(self.snapshot.neighbors_of(chunk, offsets))
    }
}
