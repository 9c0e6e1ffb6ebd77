//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RAG0__*` 覆盖（双下划线表示嵌套，如 `RAG0__ASK__TOP_K=4`），
//! 最后由命令行参数（及其 `RAG0_*` 环境变量）覆盖，见 [`ConfigOverrides`]。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub ask: AskSection,
    pub ingest: IngestSection,
    pub runtime: RuntimeSection,
}

/// [app] 段：数据目录、解析结果目录、事件日志与索引位置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub data_dir: PathBuf,
    /// 解析后的 Markdown 与元数据存放目录
    pub parsed_dir: PathBuf,
    /// 会话事件日志（SQLite），未设置时为 `<data_dir>/journal.db`
    pub journal_path: Option<PathBuf>,
    /// 向量索引目录
    pub index_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("storage"),
            parsed_dir: PathBuf::from("parsed"),
            journal_path: None,
            index_dir: PathBuf::from("storage/index"),
        }
    }
}

impl AppSection {
    pub fn journal_path(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("journal.db"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_dir.join("index.db")
    }
}

/// [llm] 段：OpenAI 兼容端点（默认本地 Ollama）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 关闭后不创建 LLM 客户端，问答始终走片段回退
    pub enabled: bool,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// 设置后对 chunk 计算嵌入并启用混合检索
    pub embedding_model: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_model(),
            base_url: default_base_url(),
            api_key: None,
            embedding_model: None,
            request_timeout_secs: 120,
        }
    }
}

fn default_model() -> String {
    "qwen3:4b".to_string()
}

fn default_base_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

/// [ask] 段：检索-反思问答参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AskSection {
    pub top_k: usize,
    pub max_reflections: u32,
    pub min_citations: usize,
    pub reflection_enabled: bool,
    pub temperature: f32,
    /// 扩展上下文时向前/向后取的相邻 chunk 数
    pub neighbor_span: u32,
    /// 复合问题最多拆成几个子问题分别检索
    pub max_subquestions: usize,
    /// 是否用 LLM 辅助评判文档相关性与答案质量（失败时退回词法评判）
    pub llm_grading: bool,
}

impl Default for AskSection {
    fn default() -> Self {
        Self {
            top_k: 6,
            max_reflections: 2,
            min_citations: 1,
            reflection_enabled: true,
            temperature: 0.0,
            neighbor_span: 1,
            max_subquestions: 3,
            llm_grading: false,
        }
    }
}

/// [ingest] 段：分块参数（单位：词）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub chunk_merge_threshold: usize,
    /// 计算嵌入时的并发请求数
    pub embed_concurrency: usize,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            chunk_size: 700,
            chunk_overlap: 150,
            chunk_merge_threshold: 60,
            embed_concurrency: 4,
        }
    }
}

/// [runtime] 段：活动执行的重试、超时与并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub activity_timeout_secs: u64,
    pub max_concurrent_activities: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            activity_timeout_secs: 120,
            max_concurrent_activities: 4,
        }
    }
}

/// 命令行层的覆盖项；`None` 表示沿用文件/环境变量中的值
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub embedding_model: Option<String>,
    pub top_k: Option<usize>,
    pub max_reflections: Option<u32>,
    pub min_citations: Option<usize>,
    pub reflection_enabled: Option<bool>,
    pub temperature: Option<f32>,
    pub neighbor_span: Option<u32>,
    pub max_subquestions: Option<usize>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub chunk_merge_threshold: Option<usize>,
    pub data_dir: Option<PathBuf>,
    pub no_llm: bool,
}

impl AppConfig {
    pub fn apply_overrides(&mut self, o: &ConfigOverrides) {
        if let Some(v) = &o.model {
            self.llm.model = v.clone();
        }
        if let Some(v) = &o.base_url {
            self.llm.base_url = v.clone();
        }
        if let Some(v) = &o.embedding_model {
            self.llm.embedding_model = Some(v.clone());
        }
        if o.no_llm {
            self.llm.enabled = false;
        }
        if let Some(v) = o.top_k {
            self.ask.top_k = v;
        }
        if let Some(v) = o.max_reflections {
            self.ask.max_reflections = v;
        }
        if let Some(v) = o.min_citations {
            self.ask.min_citations = v;
        }
        if let Some(v) = o.reflection_enabled {
            self.ask.reflection_enabled = v;
        }
        if let Some(v) = o.temperature {
            self.ask.temperature = v;
        }
        if let Some(v) = o.neighbor_span {
            self.ask.neighbor_span = v;
        }
        if let Some(v) = o.max_subquestions {
            self.ask.max_subquestions = v;
        }
        if let Some(v) = o.chunk_size {
            self.ingest.chunk_size = v;
        }
        if let Some(v) = o.chunk_overlap {
            self.ingest.chunk_overlap = v;
        }
        if let Some(v) = o.chunk_merge_threshold {
            self.ingest.chunk_merge_threshold = v;
        }
        if let Some(dir) = &o.data_dir {
            self.app.index_dir = dir.join("index");
            self.app.data_dir = dir.clone();
        }
    }

    /// 拒绝无法运行的组合（其余数值在使用处钳制）
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if self.ask.top_k == 0 {
            return Err(config::ConfigError::Message("ask.top_k must be at least 1".into()));
        }
        if self.runtime.max_attempts == 0 {
            return Err(config::ConfigError::Message(
                "runtime.max_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.ask.temperature) {
            return Err(config::ConfigError::Message(format!(
                "ask.temperature {} is outside 0.0..=2.0",
                self.ask.temperature
            )));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 RAG0__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、rag0.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RAG0__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "rag0"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if !path.exists() {
            return Err(config::ConfigError::NotFound(path.display().to_string()));
        }
        builder = builder.add_source(config::File::from(path.clone()));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RAG0")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
