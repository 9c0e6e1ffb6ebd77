//! RAG0 - 本地知识库问答
//!
//! 入口：解析参数、加载配置、打开事件日志与向量索引，启动或恢复会话并运行交互客户端。

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;

use rag0::ask::AskAgentConfig;
use rag0::cli::{run_session, Args, ClientExit};
use rag0::config::load_config;
use rag0::core::{EventJournal, MemoryJournal, Orchestrator, SessionOptions, SqliteJournal};
use rag0::index::VectorStore;
use rag0::llm::{create_embedder_from_config, create_llm_from_config};
use rag0::workflow::WorkflowHost;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rag0::observability::init(args.verbose);

    let mut cfg = load_config(args.config.clone()).context("Failed to load config")?;
    cfg.apply_overrides(&args.to_overrides());
    cfg.validate().context("Invalid configuration")?;

    let journal: Arc<dyn EventJournal> = if args.ephemeral {
        Arc::new(MemoryJournal::new())
    } else {
        let path = cfg.app.journal_path();
        Arc::new(
            SqliteJournal::open(&path)
                .with_context(|| format!("Failed to open event journal {}", path.display()))?,
        )
    };

    if args.list_sessions {
        for id in journal.sessions().context("Failed to list sessions")? {
            println!("{id}");
        }
        return Ok(());
    }

    let index_path = cfg.app.index_path();
    let store = VectorStore::open(&index_path, create_embedder_from_config(&cfg.llm))
        .with_context(|| format!("Failed to open vector index {}", index_path.display()))?;
    let llm = create_llm_from_config(&cfg.llm, args.mock_llm);
    let host = WorkflowHost::from_config(&cfg, Arc::new(store), llm);

    let orchestrator = Orchestrator::new(
        journal,
        Arc::new(host),
        SessionOptions {
            ask: AskAgentConfig::from_section(&cfg.ask),
            ..SessionOptions::default()
        },
    );
    let handle = match &args.session {
        Some(id) => orchestrator
            .resume(id)
            .with_context(|| format!("Failed to resume session {id}"))?,
        None => orchestrator.start().context("Failed to start session")?,
    };
    println!("Session: {}", handle.id());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    let exit = tokio::select! {
        exit = run_session(&handle, stdin, &mut stdout) => Some(exit.context("Client I/O failed")?),
        _ = tokio::signal::ctrl_c() => None,
    };

    if exit != Some(ClientExit::Closed) {
        handle.detach();
        if !args.ephemeral {
            println!("\nSession {} detached; resume with --session {}", handle.id(), handle.id());
        }
    }

    handle
        .finished()
        .await
        .context("Session ended with a fatal error")?;
    Ok(())
}
