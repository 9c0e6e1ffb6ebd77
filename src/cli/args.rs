//! 命令行参数；每个调优项都可由 `RAG0_*` 环境变量提供

use std::path::PathBuf;

use clap::Parser;

use crate::config::ConfigOverrides;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "rag0", version, about = "Local knowledge-base Q&A with a resumable command session")]
pub struct Args {
    /// 额外的 TOML 配置文件
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 恢复已有会话
    #[arg(long)]
    pub session: Option<String>,

    /// 列出事件日志中的会话后退出
    #[arg(long)]
    pub list_sessions: bool,

    /// 事件日志只放在内存中（会话不可恢复）
    #[arg(long)]
    pub ephemeral: bool,

    /// 使用确定性的 Mock LLM
    #[arg(long, conflicts_with = "no_llm")]
    pub mock_llm: bool,

    /// 不连接 LLM，问答只返回检索片段
    #[arg(long)]
    pub no_llm: bool,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "RAG0_OLLAMA_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "RAG0_OLLAMA_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "RAG0_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    #[arg(long, env = "RAG0_ASK_TOP_K")]
    pub top_k: Option<usize>,

    #[arg(long, env = "RAG0_ASK_MAX_REFLECTIONS")]
    pub max_reflections: Option<u32>,

    #[arg(long, env = "RAG0_ASK_MIN_CITATIONS")]
    pub min_citations: Option<usize>,

    #[arg(long, env = "RAG0_ASK_REFLECTION_ENABLED", value_parser = parse_switch)]
    pub reflection_enabled: Option<bool>,

    #[arg(long, env = "RAG0_ASK_TEMPERATURE")]
    pub temperature: Option<f32>,

    #[arg(long, env = "RAG0_ASK_NEIGHBOR_SPAN")]
    pub neighbor_span: Option<u32>,

    #[arg(long, env = "RAG0_ASK_MAX_SUBQUESTIONS")]
    pub max_subquestions: Option<usize>,

    #[arg(long, env = "RAG0_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    #[arg(long, env = "RAG0_CHUNK_OVERLAP")]
    pub chunk_overlap: Option<usize>,

    #[arg(long, env = "RAG0_CHUNK_MERGE_THRESHOLD")]
    pub chunk_merge_threshold: Option<usize>,

    /// -v 输出 debug 日志，-vv 包含依赖库
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn to_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            embedding_model: self.embedding_model.clone(),
            top_k: self.top_k,
            max_reflections: self.max_reflections,
            min_citations: self.min_citations,
            reflection_enabled: self.reflection_enabled,
            temperature: self.temperature,
            neighbor_span: self.neighbor_span,
            max_subquestions: self.max_subquestions,
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            chunk_merge_threshold: self.chunk_merge_threshold,
            data_dir: self.data_dir.clone(),
            no_llm: self.no_llm,
        }
    }
}

/// 开关值：0/false/no/off 为假，1/true/yes/on 为真
pub fn parse_switch(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        other => Err(format!("expected one of 0/1/true/false/yes/no/on/off, got '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_switch() {
        for raw in ["0", "false", "No", " off "] {
            assert_eq!(parse_switch(raw), Ok(false));
        }
        for raw in ["1", "TRUE", "yes", "on"] {
            assert_eq!(parse_switch(raw), Ok(true));
        }
        assert!(parse_switch("maybe").is_err());
    }

    #[test]
    fn test_flags_become_overrides() {
        let args = Args::try_parse_from([
            "rag0",
            "--top-k",
            "4",
            "--max-reflections",
            "0",
            "--reflection-enabled",
            "off",
            "--max-subquestions",
            "2",
            "--model",
            "llama3",
            "--no-llm",
        ])
        .unwrap();
        let o = args.to_overrides();
        assert_eq!(o.top_k, Some(4));
        assert_eq!(o.max_reflections, Some(0));
        assert_eq!(o.reflection_enabled, Some(false));
        assert_eq!(o.max_subquestions, Some(2));
        assert_eq!(o.model.as_deref(), Some("llama3"));
        assert!(o.no_llm);
        assert!(o.chunk_size.is_none());
    }

    #[test]
    fn test_mock_and_no_llm_conflict() {
        assert!(Args::try_parse_from(["rag0", "--mock-llm", "--no-llm"]).is_err());
    }
}
