//! 文档类型检测：文件头魔数优先，其次 UTF-8 探测与扩展名

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::ActivityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Text,
    Markdown,
    Pdf,
    Image,
    Unknown,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Text => "text",
            DocumentType::Markdown => "markdown",
            DocumentType::Pdf => "pdf",
            DocumentType::Image => "image",
            DocumentType::Unknown => "unknown",
        }
    }

    /// 不经过文本抽取即可读取
    pub fn is_plain_text(&self) -> bool {
        matches!(self, DocumentType::Text | DocumentType::Markdown)
    }
}

const IMAGE_SIGNATURES: &[&[u8]] = &[
    b"\x89PNG\r\n\x1a\n",
    b"\xff\xd8\xff",
    b"II*\x00",
    b"MM\x00*",
    b"BM",
    b"GIF87a",
    b"GIF89a",
];

/// 按文件头与内容判断类型
pub fn detect_bytes(header: &[u8], extension: Option<&str>) -> DocumentType {
    if header.starts_with(b"%PDF") {
        return DocumentType::Pdf;
    }
    if IMAGE_SIGNATURES.iter().any(|sig| header.starts_with(sig)) {
        return DocumentType::Image;
    }
    let looks_textual = match std::str::from_utf8(header) {
        Ok(s) => !s.contains('\0'),
        // 截断在多字节字符中间
        Err(e) => e.error_len().is_none() && !header[..e.valid_up_to()].contains(&0),
    };
    if !looks_textual {
        return DocumentType::Unknown;
    }
    match extension.map(str::to_ascii_lowercase).as_deref() {
        Some("md" | "markdown" | "mdx") => DocumentType::Markdown,
        _ => DocumentType::Text,
    }
}

/// 检测活动：路径必须存在且为文件
pub fn detect_document_type(path: &Path) -> Result<DocumentType, ActivityError> {
    let meta = std::fs::metadata(path)
        .map_err(|e| ActivityError::Rejected(format!("cannot read {}: {}", path.display(), e)))?;
    if !meta.is_file() {
        return Err(ActivityError::Rejected(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let mut header = Vec::with_capacity(4096);
    std::fs::File::open(path)
        .and_then(|f| f.take(4096).read_to_end(&mut header))
        .map_err(|e| ActivityError::Transient(format!("read {}: {}", path.display(), e)))?;
    let extension = path.extension().and_then(|e| e.to_str());
    Ok(detect_bytes(&header, extension))
}
