//! 状态定义：PromptRevision / ResultRevision 快照与会话状态机
//!
//! 编排器把每个状态变化先写成 [`SessionEvent`] 追加到事件日志，再通过纯函数
//! [`SessionState::apply`] 折叠进内存状态。进程重启后按同样顺序重放即可得到完全相同的状态。
//! 客户端只看两个独立递增的修订号，从不比较内容。

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::commands::CommandRequest;

/// 保留的最近结果条数；客户端按修订号逐条读取，落后超过该窗口时从最旧的一条继续
pub const RESULT_HISTORY: usize = 64;

/// 提示快照；修订号为 0 表示尚未渲染过菜单
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRevision {
    pub revision: u64,
    pub prompt: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
    Quit,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Ok => "ok",
            ResultStatus::Error => "error",
            ResultStatus::Quit => "quit",
        }
    }
}

/// 结果快照，修订号独立于提示修订号
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRevision {
    pub revision: u64,
    pub status: ResultStatus,
    /// 产生该结果的命令（解析失败时为 `parse`）
    pub command: String,
    pub payload: String,
}

/// 会话阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// 尚未写入 Started
    New,
    /// 已记录结果，等待重新渲染菜单
    Idle,
    AwaitingInput,
    Dispatching,
    AwaitingChild,
    Closed,
}

/// 正在等待的子执行（ingest / ask）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChild {
    pub child_id: String,
    pub request: CommandRequest,
}

/// 事件日志中的一条记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { started_at: String },
    PromptRendered { prompt: String },
    InputSignalled { raw: String },
    InputDequeued,
    ChildStarted { child_id: String, request: CommandRequest },
    /// quit 抢占：子执行继续跑完，但结果被丢弃
    ChildAbandoned { child_id: String },
    ResultRecorded {
        status: ResultStatus,
        command: String,
        payload: String,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Started { .. } => "started",
            SessionEvent::PromptRendered { .. } => "prompt_rendered",
            SessionEvent::InputSignalled { .. } => "input_signalled",
            SessionEvent::InputDequeued => "input_dequeued",
            SessionEvent::ChildStarted { .. } => "child_started",
            SessionEvent::ChildAbandoned { .. } => "child_abandoned",
            SessionEvent::ResultRecorded { .. } => "result_recorded",
        }
    }
}

/// 事件与当前阶段不一致：日志被篡改或损坏
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("event {event} is not valid in phase {phase:?}")]
    InvalidTransition {
        event: &'static str,
        phase: SessionPhase,
    },

    #[error("input_dequeued with an empty input queue")]
    EmptyQueue,

    #[error("child_abandoned for {found} but the pending child is {expected}")]
    ChildMismatch { expected: String, found: String },
}

/// 会话内部完整状态（由事件折叠得到）
#[derive(Clone, Debug, PartialEq)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub prompt: PromptRevision,
    pub last_result: Option<ResultRevision>,
    /// 最近的结果，按修订号升序
    pub recent_results: VecDeque<ResultRevision>,
    /// 已接收但尚未处理的输入，严格按到达顺序
    pub pending_inputs: VecDeque<String>,
    /// 正在分派的输入
    pub current_input: Option<String>,
    pub pending_child: Option<PendingChild>,
    pub events_applied: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::New,
            prompt: PromptRevision::default(),
            last_result: None,
            recent_results: VecDeque::new(),
            pending_inputs: VecDeque::new(),
            current_input: None,
            pending_child: None,
            events_applied: 0,
        }
    }
}

impl SessionState {
    /// 从事件序列重建状态
    pub fn replay<'a, I>(events: I) -> Result<Self, HistoryError>
    where
        I: IntoIterator<Item = &'a SessionEvent>,
    {
        let mut state = Self::default();
        for event in events {
            state.apply(event)?;
        }
        Ok(state)
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    /// 修订号大于 after 的第一条结果
    pub fn result_after(&self, after: u64) -> Option<&ResultRevision> {
        result_after(&self.recent_results, after)
    }

    /// 纯状态转移；失败时状态保持不变
    pub fn apply(&mut self, event: &SessionEvent) -> Result<(), HistoryError> {
        let invalid = |phase| HistoryError::InvalidTransition {
            event: event.kind(),
            phase,
        };

        match event {
            SessionEvent::Started { .. } => {
                if self.phase != SessionPhase::New {
                    return Err(invalid(self.phase));
                }
                self.phase = SessionPhase::Idle;
            }
            SessionEvent::PromptRendered { prompt } => {
                if !matches!(self.phase, SessionPhase::Idle | SessionPhase::Dispatching) {
                    return Err(invalid(self.phase));
                }
                self.prompt = PromptRevision {
                    revision: self.prompt.revision + 1,
                    prompt: prompt.clone(),
                };
                self.current_input = None;
                self.phase = SessionPhase::AwaitingInput;
            }
            SessionEvent::InputSignalled { raw } => {
                if matches!(self.phase, SessionPhase::New | SessionPhase::Closed) {
                    return Err(invalid(self.phase));
                }
                self.pending_inputs.push_back(raw.clone());
            }
            SessionEvent::InputDequeued => {
                if self.phase != SessionPhase::AwaitingInput {
                    return Err(invalid(self.phase));
                }
                let raw = self.pending_inputs.pop_front().ok_or(HistoryError::EmptyQueue)?;
                self.current_input = Some(raw);
                self.phase = SessionPhase::Dispatching;
            }
            SessionEvent::ChildStarted { child_id, request } => {
                if self.phase != SessionPhase::Dispatching {
                    return Err(invalid(self.phase));
                }
                self.pending_child = Some(PendingChild {
                    child_id: child_id.clone(),
                    request: request.clone(),
                });
                self.current_input = None;
                self.phase = SessionPhase::AwaitingChild;
            }
            SessionEvent::ChildAbandoned { child_id } => {
                let pending = match (&self.phase, &self.pending_child) {
                    (SessionPhase::AwaitingChild, Some(p)) => p,
                    _ => return Err(invalid(self.phase)),
                };
                if &pending.child_id != child_id {
                    return Err(HistoryError::ChildMismatch {
                        expected: pending.child_id.clone(),
                        found: child_id.clone(),
                    });
                }
                self.pending_child = None;
                self.phase = SessionPhase::Dispatching;
            }
            SessionEvent::ResultRecorded {
                status,
                command,
                payload,
            } => {
                if !matches!(
                    self.phase,
                    SessionPhase::Dispatching | SessionPhase::AwaitingChild
                ) {
                    return Err(invalid(self.phase));
                }
                let revision = self.last_result.as_ref().map_or(0, |r| r.revision) + 1;
                let result = ResultRevision {
                    revision,
                    status: *status,
                    command: command.clone(),
                    payload: payload.clone(),
                };
                if self.recent_results.len() == RESULT_HISTORY {
                    self.recent_results.pop_front();
                }
                self.recent_results.push_back(result.clone());
                self.last_result = Some(result);
                self.current_input = None;
                self.pending_child = None;
                if *status == ResultStatus::Quit {
                    self.pending_inputs.clear();
                    self.phase = SessionPhase::Closed;
                } else {
                    self.phase = SessionPhase::Idle;
                }
            }
        }

        self.events_applied += 1;
        Ok(())
    }
}

/// 在升序结果窗口中找修订号大于 after 的第一条
pub fn result_after(results: &VecDeque<ResultRevision>, after: u64) -> Option<&ResultRevision> {
    results.iter().find(|r| r.revision > after)
}
