//! 交互客户端：逐行提交输入，轮询提示与结果修订号
//!
//! 客户端从不等待编排器推送。它记住已经看到的两个修订号，按 50ms 起步、翻倍到 500ms 的退避轮询，
//! 修订号前进即输出；会话关闭或循环停止时返回。

pub mod args;

use std::io::Write;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::core::{PromptRevision, ResultRevision, ResultStatus, SessionHandle};

pub use args::{parse_switch, Args};

const INITIAL_POLL: Duration = Duration::from_millis(50);
const MAX_POLL: Duration = Duration::from_millis(500);

/// 轮询退避
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { current: INITIAL_POLL }
    }
}

impl Backoff {
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_POLL;
    }

    pub async fn wait(&mut self) {
        tokio::time::sleep(self.current).await;
        self.current = (self.current * 2).min(MAX_POLL);
    }
}

/// 等到提示修订号超过 after；会话已关闭或循环已停止时返回 None
pub async fn wait_for_prompt(handle: &SessionHandle, after: u64) -> Option<PromptRevision> {
    let mut backoff = Backoff::default();
    loop {
        if let Some(prompt) = handle.get_next_prompt(after) {
            return Some(prompt);
        }
        if handle.is_closed() || !handle.is_running() {
            return None;
        }
        backoff.wait().await;
    }
}

/// 等到结果修订号超过 after；循环已停止时返回 None
pub async fn wait_for_result(handle: &SessionHandle, after: u64) -> Option<ResultRevision> {
    let mut backoff = Backoff::default();
    loop {
        if let Some(result) = handle.get_last_result(after) {
            return Some(result);
        }
        if !handle.is_running() {
            return None;
        }
        backoff.wait().await;
    }
}

/// 客户端结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientExit {
    /// 会话收到 quit
    Closed,
    /// 会话循环已停止（detach），可稍后恢复
    Detached,
    /// 标准输入结束
    InputEnded,
}

pub fn render_result(result: &ResultRevision) -> String {
    match result.status {
        ResultStatus::Error => format!("Error ({}): {}", result.command, result.payload),
        ResultStatus::Ok | ResultStatus::Quit => result.payload.clone(),
    }
}

/// 交互主循环：输出进度与结果，每次出现新提示时读取一行输入
pub async fn run_session<R, W>(handle: &SessionHandle, input: R, out: &mut W) -> std::io::Result<ClientExit>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let mut lines = input.lines();
    let mut seen_prompt = 0;
    // 恢复时不重复输出旧结果
    let mut seen_result = handle.latest_result().map_or(0, |r| r.revision);
    let mut shown_progress = 0;
    let mut backoff = Backoff::default();

    if handle.is_closed() {
        return Ok(ClientExit::Closed);
    }

    loop {
        let mut advanced = false;

        let progress = handle.get_progress();
        if progress.len() < shown_progress {
            shown_progress = 0;
        }
        for event in &progress[shown_progress..] {
            writeln!(out, "  .. {}", event.summary())?;
            advanced = true;
        }
        shown_progress = progress.len();

        if let Some(result) = handle.get_last_result(seen_result) {
            seen_result = result.revision;
            shown_progress = 0;
            writeln!(out, "{}", render_result(&result))?;
            if result.status == ResultStatus::Quit {
                out.flush()?;
                return Ok(ClientExit::Closed);
            }
            advanced = true;
        }

        if let Some(prompt) = handle.get_next_prompt(seen_prompt) {
            seen_prompt = prompt.revision;
            write!(out, "\n{}\n> ", prompt.prompt)?;
            out.flush()?;
            let Some(line) = lines.next_line().await? else {
                return Ok(ClientExit::InputEnded);
            };
            if !handle.submit_input(line) {
                return Ok(ClientExit::Detached);
            }
            backoff.reset();
            continue;
        }

        if !handle.is_running() {
            // 停止前可能刚写入了最后几条结果
            while let Some(result) = handle.get_last_result(seen_result) {
                seen_result = result.revision;
                writeln!(out, "{}", render_result(&result))?;
            }
            out.flush()?;
            return Ok(if handle.is_closed() {
                ClientExit::Closed
            } else {
                ClientExit::Detached
            });
        }

        if advanced {
            out.flush()?;
            backoff.reset();
        } else {
            backoff.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AppConfig;
    use crate::core::{MemoryJournal, Orchestrator, SessionOptions};
    use crate::index::VectorStore;
    use crate::workflow::WorkflowHost;

    fn orchestrator() -> Orchestrator {
        let store = Arc::new(VectorStore::open_in_memory(None).unwrap());
        let host = WorkflowHost::from_config(&AppConfig::default(), store, None);
        Orchestrator::new(
            Arc::new(MemoryJournal::new()),
            Arc::new(host),
            SessionOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.current(), Duration::from_millis(50));
        for _ in 0..4 {
            backoff.wait().await;
        }
        assert_eq!(backoff.current(), Duration::from_millis(500));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_scripted_session_runs_to_quit() {
        let handle = orchestrator().start().unwrap();
        let mut out = Vec::new();
        let exit = run_session(&handle, &b"\n/stats\n/bogus\n/quit\n"[..], &mut out)
            .await
            .unwrap();
        assert_eq!(exit, ClientExit::Closed);

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Vector index statistics"));
        assert!(text.contains("Error (unknown): Unknown command: bogus"));
        assert!(text.trim_end().ends_with("Goodbye."));
    }

    #[tokio::test]
    async fn test_input_end_leaves_session_open() {
        let handle = orchestrator().start().unwrap();
        let mut out = Vec::new();
        let exit = run_session(&handle, &b""[..], &mut out).await.unwrap();
        assert_eq!(exit, ClientExit::InputEnded);
        assert!(!handle.is_closed());
        assert!(handle.is_running());
    }
}
