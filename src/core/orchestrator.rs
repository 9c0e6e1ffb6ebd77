//! 命令编排器：会话主控循环
//!
//! 客户端通过 [`SessionHandle`] 交互：`submit_input` 只投递不等待；`get_next_prompt` /
//! `get_last_result` / `get_progress` 只读，随时立即返回（watch 快照）。
//! 后台任务按到达顺序逐条处理输入：每个状态变化先写入事件日志，再折叠进 [`SessionState`]。
//! ingest / ask 作为子任务运行，编排循环用 `select!` 同时等待子任务与新输入；quit 总是优先。
//! 事件日志写入失败或历史不一致是致命错误，循环以 [`SessionError`] 结束。

use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ask::{AskAgentConfig, AskEvent, AskRequest};
use crate::core::commands::{is_quit, parse_command, render_menu, CommandKind, CommandRequest};
use crate::core::journal::{EventJournal, JournalError};
use crate::core::state::{
    result_after, HistoryError, PendingChild, PromptRevision, ResultRevision, ResultStatus, SessionEvent, SessionPhase,
    SessionState,
};
use crate::core::{ActivityError, SessionSupervisor};
use crate::ingest::IngestRequest;
use crate::workflow::ChildWorkflows;

const GOODBYE: &str = "Goodbye.";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("session history is inconsistent: {0}")]
    History(#[from] HistoryError),

    #[error("session {0} not found in journal")]
    NotFound(String),

    #[error("session task aborted: {0}")]
    Aborted(String),
}

/// 会话循环结束的方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// 收到 quit，携带最终结果
    Closed(Option<ResultRevision>),
    /// 被 detach 或客户端全部断开，状态留在日志中可恢复
    Detached,
}

/// 会话选项
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub menu: String,
    pub ask: AskAgentConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            menu: render_menu(),
            ask: AskAgentConfig::default(),
        }
    }
}

/// 编排器：持有事件日志与子执行宿主，负责创建与恢复会话
#[derive(Clone)]
pub struct Orchestrator {
    journal: Arc<dyn EventJournal>,
    children: Arc<dyn ChildWorkflows>,
    options: SessionOptions,
}

impl Orchestrator {
    pub fn new(journal: Arc<dyn EventJournal>, children: Arc<dyn ChildWorkflows>, options: SessionOptions) -> Self {
        Self {
            journal,
            children,
            options,
        }
    }

    /// 新建会话；返回时初始菜单（修订号 1）已经写入
    pub fn start(&self) -> Result<SessionHandle, SessionError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        tracing::info!(session = %id, "session started");
        self.spawn(id, SessionState::default())
    }

    /// 从事件日志恢复会话，不会重复渲染已经渲染过的菜单
    pub fn resume(&self, session_id: &str) -> Result<SessionHandle, SessionError> {
        let events = self.journal.load(session_id)?;
        if events.is_empty() {
            return Err(SessionError::NotFound(session_id.to_string()));
        }
        let state = SessionState::replay(&events)?;
        tracing::info!(
            session = %session_id,
            events = events.len(),
            phase = ?state.phase,
            "session resumed"
        );
        self.spawn(session_id.to_string(), state)
    }

    fn spawn(&self, id: String, state: SessionState) -> Result<SessionHandle, SessionError> {
        let supervisor = SessionSupervisor::new(id.clone());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (prompt_tx, prompt_rx) = watch::channel(state.prompt.clone());
        let (result_tx, result_rx) = watch::channel(state.recent_results.clone());
        let (progress_tx, progress_rx) = watch::channel(Vec::new());

        let mut session = SessionLoop {
            id: id.clone(),
            journal: self.journal.clone(),
            children: self.children.clone(),
            options: self.options.clone(),
            state,
            input_rx,
            input_open: true,
            prompt_tx,
            result_tx,
            progress_tx,
            detach: supervisor.detach_token(),
        };
        session.settle()?;
        let task = tokio::spawn(session.run());

        Ok(SessionHandle {
            id,
            input_tx,
            prompt_rx,
            result_rx,
            progress_rx,
            supervisor,
            task,
        })
    }
}

/// 客户端持有的会话句柄
pub struct SessionHandle {
    id: String,
    input_tx: mpsc::UnboundedSender<String>,
    prompt_rx: watch::Receiver<PromptRevision>,
    result_rx: watch::Receiver<VecDeque<ResultRevision>>,
    progress_rx: watch::Receiver<Vec<AskEvent>>,
    supervisor: SessionSupervisor,
    task: JoinHandle<Result<SessionExit, SessionError>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 投递输入；会话已结束时返回 false
    pub fn submit_input(&self, raw: impl Into<String>) -> bool {
        self.input_tx.send(raw.into()).is_ok()
    }

    /// 修订号大于 after_revision 时返回当前提示
    pub fn get_next_prompt(&self, after_revision: u64) -> Option<PromptRevision> {
        let prompt = self.prompt_rx.borrow();
        (prompt.revision > after_revision).then(|| prompt.clone())
    }

    /// 返回修订号 after_revision 之后的下一条结果
    ///
    /// 多条结果在两次轮询之间写入时逐条返回，不会跳过；落后超过保留窗口时从最旧的一条继续。
    pub fn get_last_result(&self, after_revision: u64) -> Option<ResultRevision> {
        result_after(&self.result_rx.borrow(), after_revision).cloned()
    }

    /// 最新一条结果
    pub fn latest_result(&self) -> Option<ResultRevision> {
        self.result_rx.borrow().back().cloned()
    }

    /// 正在运行的问答子执行的进度；子执行结束后清空
    pub fn get_progress(&self) -> Vec<AskEvent> {
        self.progress_rx.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.result_rx.borrow().back(),
            Some(ResultRevision {
                status: ResultStatus::Quit,
                ..
            })
        )
    }

    /// 会话循环是否仍在运行
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// 停止会话循环但不写任何事件，之后可 resume
    pub fn detach(&self) {
        self.supervisor.detach();
    }

    /// 等待会话循环结束
    pub async fn finished(self) -> Result<SessionExit, SessionError> {
        match self.task.await {
            Ok(exit) => exit,
            Err(e) => Err(SessionError::Aborted(e.to_string())),
        }
    }
}

struct SessionLoop {
    id: String,
    journal: Arc<dyn EventJournal>,
    children: Arc<dyn ChildWorkflows>,
    options: SessionOptions,
    state: SessionState,
    input_rx: mpsc::UnboundedReceiver<String>,
    input_open: bool,
    prompt_tx: watch::Sender<PromptRevision>,
    result_tx: watch::Sender<VecDeque<ResultRevision>>,
    progress_tx: watch::Sender<Vec<AskEvent>>,
    detach: CancellationToken,
}

/// 子任务输出渲染好的结果文本
type ChildTask = JoinHandle<Result<String, ActivityError>>;

impl SessionLoop {
    /// 先写日志，再应用；事件在写入前用状态副本校验，非法事件不会落盘
    fn record(&mut self, event: SessionEvent) -> Result<(), SessionError> {
        let mut next = self.state.clone();
        next.apply(&event)?;
        self.journal.append(&self.id, &event)?;
        tracing::debug!(session = %self.id, event = event.kind(), phase = ?next.phase, "session event");
        self.state = next;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        let prompt = &self.state.prompt;
        self.prompt_tx.send_if_modified(|current| {
            if current.revision == prompt.revision {
                return false;
            }
            *current = prompt.clone();
            true
        });
        let results = &self.state.recent_results;
        self.result_tx.send_if_modified(|current| {
            if current.back().map(|r| r.revision) == results.back().map(|r| r.revision) {
                return false;
            }
            *current = results.clone();
            true
        });
    }

    fn record_result(&mut self, status: ResultStatus, command: &str, payload: String) -> Result<(), SessionError> {
        tracing::info!(session = %self.id, status = status.as_str(), command, "result recorded");
        self.record(SessionEvent::ResultRecorded {
            status,
            command: command.to_string(),
            payload,
        })
    }

    /// 同步推进不需要等待的阶段：写入 Started、渲染菜单
    fn settle(&mut self) -> Result<(), SessionError> {
        loop {
            match self.state.phase {
                SessionPhase::New => self.record(SessionEvent::Started {
                    started_at: chrono::Utc::now().to_rfc3339(),
                })?,
                SessionPhase::Idle => self.record(SessionEvent::PromptRendered {
                    prompt: self.options.menu.clone(),
                })?,
                _ => return Ok(()),
            }
        }
    }

    async fn run(mut self) -> Result<SessionExit, SessionError> {
        let outcome = self.drive().await;
        match &outcome {
            Ok(SessionExit::Closed(_)) => tracing::info!(session = %self.id, "session closed"),
            Ok(SessionExit::Detached) => tracing::info!(session = %self.id, "session loop stopped"),
            Err(e) => tracing::error!(session = %self.id, error = %e, "session failed"),
        }
        outcome
    }

    async fn drive(&mut self) -> Result<SessionExit, SessionError> {
        loop {
            if self.detach.is_cancelled() {
                return Ok(SessionExit::Detached);
            }
            match self.state.phase {
                SessionPhase::New | SessionPhase::Idle => self.settle()?,
                SessionPhase::AwaitingInput => {
                    if !self.state.pending_inputs.is_empty() {
                        self.record(SessionEvent::InputDequeued)?;
                        continue;
                    }
                    if !self.input_open {
                        return Ok(SessionExit::Detached);
                    }
                    let detach = self.detach.clone();
                    tokio::select! {
                        biased;
                        _ = detach.cancelled() => return Ok(SessionExit::Detached),
                        raw = self.input_rx.recv() => match raw {
                            Some(raw) => self.record(SessionEvent::InputSignalled { raw })?,
                            None => self.input_open = false,
                        },
                    }
                }
                SessionPhase::Dispatching => match self.state.current_input.clone() {
                    Some(raw) => self.dispatch(&raw).await?,
                    // 子执行被 quit 抢占之后
                    None => self.record_result(ResultStatus::Quit, "quit", GOODBYE.to_string())?,
                },
                SessionPhase::AwaitingChild => {
                    if self.await_child().await? {
                        return Ok(SessionExit::Detached);
                    }
                }
                SessionPhase::Closed => return Ok(SessionExit::Closed(self.state.last_result.clone())),
            }
        }
    }

    async fn dispatch(&mut self, raw: &str) -> Result<(), SessionError> {
        if raw.trim().is_empty() {
            return self.record(SessionEvent::PromptRendered {
                prompt: self.options.menu.clone(),
            });
        }
        let request = match parse_command(raw) {
            Ok(r) => r,
            Err(e) => return self.record_result(ResultStatus::Error, "parse", e.to_string()),
        };
        tracing::info!(session = %self.id, command = request.command.as_str(), "dispatching command");

        match request.command {
            CommandKind::Stats => {
                let (status, payload) = match self.children.stats().await {
                    Ok(stats) => (ResultStatus::Ok, stats.render()),
                    Err(e) => (ResultStatus::Error, e.reason()),
                };
                self.record_result(status, "stats", payload)
            }
            CommandKind::Quit => self.record_result(ResultStatus::Quit, "quit", GOODBYE.to_string()),
            CommandKind::Unknown => {
                let payload = format!("Unknown command: {}", request.first_argument());
                self.record_result(ResultStatus::Error, "unknown", payload)
            }
            CommandKind::Ingest | CommandKind::Ask => {
                let child_id = format!(
                    "{}-{}-{}",
                    self.id,
                    request.command.as_str(),
                    self.state.events_applied
                );
                self.record(SessionEvent::ChildStarted { child_id, request })
            }
        }
    }

    fn launch(&self, pending: &PendingChild) -> (ChildTask, Option<mpsc::UnboundedReceiver<AskEvent>>) {
        let children = self.children.clone();
        let child_id = pending.child_id.clone();
        let request: &CommandRequest = &pending.request;
        match request.command {
            CommandKind::Ingest => {
                let req = IngestRequest {
                    payload_reference: request.first_argument().to_string(),
                };
                let task = tokio::spawn(async move {
                    children.ingest(&child_id, req).await.map(|r| r.render())
                });
                (task, None)
            }
            CommandKind::Ask => {
                let req = AskRequest {
                    question: request.first_argument().to_string(),
                    config: self.options.ask.clone(),
                };
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(async move {
                    children.ask(&child_id, req, Some(tx)).await.map(|a| a.render())
                });
                (task, Some(rx))
            }
            other => {
                let reason = format!("{} cannot run as a child execution", other.as_str());
                (tokio::spawn(async move { Err(ActivityError::Rejected(reason)) }), None)
            }
        }
    }

    /// quit 抢占：记录放弃，子任务自行结束，结果丢弃
    fn abandon(&mut self, child_id: String) -> Result<(), SessionError> {
        tracing::info!(session = %self.id, child_id = %child_id, "quit received, abandoning child");
        self.progress_tx.send_replace(Vec::new());
        self.record(SessionEvent::ChildAbandoned { child_id })
    }

    /// 等待子执行；返回 true 表示会话被 detach
    async fn await_child(&mut self) -> Result<bool, SessionError> {
        let Some(pending) = self.state.pending_child.clone() else {
            return Err(HistoryError::InvalidTransition {
                event: "child_started",
                phase: self.state.phase,
            }
            .into());
        };
        if self.state.pending_inputs.iter().any(|raw| is_quit(raw)) {
            self.abandon(pending.child_id)?;
            return Ok(false);
        }

        tracing::info!(session = %self.id, child_id = %pending.child_id, "child launched");
        let (mut task, mut progress) = self.launch(&pending);
        self.progress_tx.send_replace(Vec::new());
        let detach = self.detach.clone();

        loop {
            tokio::select! {
                biased;
                _ = detach.cancelled() => {
                    task.abort();
                    return Ok(true);
                }
                raw = self.input_rx.recv(), if self.input_open => match raw {
                    Some(raw) => {
                        let quit = is_quit(&raw);
                        self.record(SessionEvent::InputSignalled { raw })?;
                        if quit {
                            self.abandon(pending.child_id)?;
                            return Ok(false);
                        }
                    }
                    None => self.input_open = false,
                },
                event = next_progress(&mut progress) => match event {
                    Some(event) => {
                        self.progress_tx.send_modify(|events| events.push(event));
                    }
                    None => progress = None,
                },
                joined = &mut task => {
                    let (status, payload) = match joined {
                        Ok(Ok(payload)) => (ResultStatus::Ok, payload),
                        Ok(Err(e)) => (ResultStatus::Error, e.reason()),
                        Err(e) if e.is_panic() => (
                            ResultStatus::Error,
                            format!("{} child execution panicked", pending.request.command.as_str()),
                        ),
                        Err(e) => (ResultStatus::Error, e.to_string()),
                    };
                    self.progress_tx.send_replace(Vec::new());
                    self.record_result(status, pending.request.command.as_str(), payload)?;
                    return Ok(false);
                }
            }
        }
    }
}

async fn next_progress(rx: &mut Option<mpsc::UnboundedReceiver<AskEvent>>) -> Option<AskEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
