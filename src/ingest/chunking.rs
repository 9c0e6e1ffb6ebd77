//! 文档分块
//!
//! 以段落（空行分隔）为单位：先把相邻的短段落合并，再按词数装箱成 chunk，
//! 相邻 chunk 之间按整段回退实现重叠。词数按空白切分计算。

use crate::config::IngestSection;

/// 分块策略（单位：词）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// 相邻两段都少于该词数时合并
    pub merge_threshold: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::from_section(&IngestSection::default())
    }
}

impl ChunkingConfig {
    pub fn from_section(cfg: &IngestSection) -> Self {
        Self {
            chunk_size: cfg.chunk_size,
            chunk_overlap: cfg.chunk_overlap,
            merge_threshold: cfg.chunk_merge_threshold,
        }
    }

    /// size 至少为 1，overlap 小于 size
    pub fn clamp(&self) -> Self {
        let size = self.chunk_size.max(1);
        Self {
            chunk_size: size,
            chunk_overlap: self.chunk_overlap.min(size - 1),
            merge_threshold: self.merge_threshold,
        }
    }
}

/// 文档块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub chunk_id: String,
    pub ordinal: usize,
    pub text: String,
    pub word_count: usize,
}

struct Segment {
    text: String,
    words: usize,
}

/// 文档分块器
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self {
            config: config.clamp(),
        }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// 将文档切分为 chunk；stem 用于生成 `<stem>-chunk-0001` 形式的 ID
    pub fn chunk(&self, stem: &str, text: &str) -> Vec<Chunk> {
        let segments = self.merge_short_paragraphs(text);
        if segments.is_empty() {
            return Vec::new();
        }

        let cfg = &self.config;
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < segments.len() {
            let mut end = start;
            let mut words = 0;
            while end < segments.len() && (words < cfg.chunk_size || end == start) {
                words += segments[end].words;
                end += 1;
                if words >= cfg.chunk_size && end - start > 1 {
                    break;
                }
            }

            let text = segments[start..end]
                .iter()
                .map(|s| s.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let ordinal = chunks.len();
            chunks.push(Chunk {
                chunk_id: format!("{}-chunk-{:04}", stem, ordinal + 1),
                ordinal,
                text,
                word_count: words,
            });

            if end >= segments.len() {
                break;
            }
            if cfg.chunk_overlap == 0 {
                start = end;
                continue;
            }

            // 从窗口末尾整段回退，直到覆盖 overlap 个词；至少前进一段
            let mut remaining = cfg.chunk_overlap as isize;
            let mut back = end - 1;
            while back > start && remaining > 0 {
                remaining -= segments[back].words as isize;
                back -= 1;
            }
            start = (back + 1).min(end);
        }

        chunks
    }

    fn merge_short_paragraphs(&self, text: &str) -> Vec<Segment> {
        let threshold = self.config.merge_threshold;
        let mut merged: Vec<Segment> = Vec::new();

        for paragraph in split_paragraphs(text) {
            let words = paragraph.split_whitespace().count();
            match merged.last_mut() {
                Some(last) if last.words < threshold && words < threshold => {
                    last.text.push_str("\n\n");
                    last.text.push_str(&paragraph);
                    last.words += words;
                }
                _ => merged.push(Segment {
                    text: paragraph,
                    words,
                }),
            }
        }
        merged
    }
}

/// 按空行切分段落，去掉首尾空白与空段
fn split_paragraphs(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n");
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in normalized.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n").trim().to_string());
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n").trim().to_string());
    }
    paragraphs.retain(|p| !p.is_empty());
    paragraphs
}
