//! 核心编排层：命令解析、事件日志、状态折叠、会话监管、重试与主控循环

pub mod commands;
pub mod error;
pub mod journal;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use commands::{parse_command, render_menu, CommandKind, CommandRequest};
pub use error::{ActivityError, CommandParseError, GenerationUnavailable, RecoveryAction};
pub use journal::{EventJournal, JournalError, MemoryJournal, SqliteJournal};
pub use orchestrator::{Orchestrator, SessionError, SessionExit, SessionHandle, SessionOptions};
pub use recovery::RecoveryEngine;
pub use session_supervisor::SessionSupervisor;
pub use state::{PromptRevision, ResultRevision, ResultStatus, SessionEvent, SessionPhase, SessionState};
pub use task_scheduler::TaskScheduler;
