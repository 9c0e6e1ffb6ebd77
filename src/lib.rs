//! RAG0 - 本地知识库问答
//!
//! 模块划分：
//! - **ask**: 检索-反思问答状态机（retrieve / grade / rewrite / generate）
//! - **cli**: 命令行参数与逐行交互客户端
//! - **config**: 配置加载（TOML + 环境变量 + 命令行覆盖）
//! - **core**: 命令解析、事件日志、会话状态折叠与主控编排
//! - **index**: 向量索引（SQLite 持久化、不可变快照、混合检索）
//! - **ingest**: 文档导入流水线（detect → parse → chunk → persist → index）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）与嵌入
//! - **observability**: tracing 初始化
//! - **runtime**: 活动运行时（重试、超时、并发上限、审计）
//! - **workflow**: 子执行宿主

pub mod ask;
pub mod cli;
pub mod config;
pub mod core;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod observability;
pub mod runtime;
pub mod workflow;

pub use crate::core::{Orchestrator, SessionHandle, SessionOptions};
