//! 解析结果存储：`<parsed_dir>/<stem>-<fp12>.md` 与同名 `.metadata.json`
//!
//! 文件名包含指纹前缀，同一内容重复写入得到同一路径，活动可安全重试。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::ActivityError;

/// 与解析结果一起落盘的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMetadata {
    pub file_name: String,
    pub source_path: String,
    pub document_type: String,
    pub fingerprint: String,
    pub size_bytes: u64,
    pub parsed_at: String,
    pub paragraphs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPaths {
    pub markdown_path: PathBuf,
    pub metadata_path: PathBuf,
}

pub fn store_parsed_markdown(
    output_dir: &Path,
    stem: &str,
    markdown: &str,
    metadata: &ParsedMetadata,
) -> Result<StoredPaths, ActivityError> {
    let io_err = |what: &str, e: std::io::Error| ActivityError::Transient(format!("{what}: {e}"));

    std::fs::create_dir_all(output_dir).map_err(|e| io_err("create parsed dir", e))?;
    let prefix: String = metadata.fingerprint.chars().take(12).collect();
    let base = format!("{stem}-{prefix}");
    let markdown_path = output_dir.join(format!("{base}.md"));
    let metadata_path = output_dir.join(format!("{base}.metadata.json"));

    std::fs::write(&markdown_path, markdown).map_err(|e| io_err("write markdown", e))?;
    let payload = serde_json::to_string_pretty(metadata)
        .map_err(|e| ActivityError::Rejected(format!("serialize metadata: {e}")))?;
    std::fs::write(&metadata_path, payload).map_err(|e| io_err("write metadata", e))?;

    Ok(StoredPaths {
        markdown_path: markdown_path.canonicalize().unwrap_or(markdown_path),
        metadata_path: metadata_path.canonicalize().unwrap_or(metadata_path),
    })
}

/// 读取元数据（调试与测试用）
pub fn load_metadata(path: &Path) -> Result<ParsedMetadata, ActivityError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ActivityError::Rejected(format!("read {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| ActivityError::Rejected(format!("parse {}: {}", path.display(), e)))
}
