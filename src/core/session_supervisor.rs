//! 会话监管：生命周期、分离
//!
//! 持有 CancellationToken。用户 Ctrl+C 或测试模拟进程重启时触发 detach：
//! 编排循环立即停止且不写任何事件，之后可从事件日志恢复同一会话。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    session_id: String,
    detach_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            detach_token: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn detach_token(&self) -> CancellationToken {
        self.detach_token.clone()
    }

    pub fn detach(&self) {
        tracing::info!(session = %self.session_id, "session detached");
        self.detach_token.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.detach_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detach_cancels_token() {
        let sup = SessionSupervisor::new("s1");
        let token = sup.detach_token();
        assert!(!sup.is_detached());
        sup.detach();
        assert!(sup.is_detached());
        assert!(token.is_cancelled());
        assert_eq!(sup.session_id(), "s1");
    }
}
