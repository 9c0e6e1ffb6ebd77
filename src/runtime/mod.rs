//! 活动运行时
//!
//! 对每次活动调用：从工作池取许可、施加单次超时、按 RecoveryEngine 的建议退避重试，
//! 每次尝试输出一条结构化审计日志（JSON）。活动必须幂等，重试可能重复执行。

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::config::RuntimeSection;
use crate::core::{ActivityError, RecoveryAction, RecoveryEngine, TaskScheduler};

/// 活动执行器：可克隆，克隆体共享工作池
#[derive(Clone, Debug)]
pub struct ActivityRuntime {
    recovery: RecoveryEngine,
    scheduler: TaskScheduler,
    timeout: Duration,
}

impl ActivityRuntime {
    pub fn new(recovery: RecoveryEngine, scheduler: TaskScheduler, timeout: Duration) -> Self {
        Self {
            recovery,
            scheduler,
            timeout,
        }
    }

    pub fn from_config(cfg: &RuntimeSection) -> Self {
        Self::new(
            RecoveryEngine::from_config(cfg),
            TaskScheduler::new(cfg.max_concurrent_activities),
            Duration::from_secs(cfg.activity_timeout_secs.max(1)),
        )
    }

    #[cfg(test)]
    pub(crate) fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// 执行活动直到成功或放弃；放弃时可重试错误包装为 Exhausted，不可重试错误原样返回
    pub async fn execute<T, F, Fut>(&self, activity: &str, mut op: F) -> Result<T, ActivityError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ActivityError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = {
                let _permit = self.scheduler.acquire().await?;
                match timeout(self.timeout, op()).await {
                    Ok(r) => r,
                    Err(_) => Err(ActivityError::Timeout(activity.to_string())),
                }
            };

            let outcome = match &result {
                Ok(_) => "ok",
                Err(ActivityError::Timeout(_)) => "timeout",
                Err(_) => "error",
            };
            let audit = serde_json::json!({
                "event": "activity_audit",
                "activity": activity,
                "attempt": attempt,
                "outcome": outcome,
                "duration_ms": start.elapsed().as_millis() as u64,
            });
            tracing::info!(audit = %audit.to_string(), "activity");

            let err = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match self.recovery.handle(&err, attempt) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(activity, attempt, error = %err, ?delay, "activity failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                RecoveryAction::GiveUp if err.is_retryable() => {
                    return Err(ActivityError::Exhausted {
                        activity: activity.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                RecoveryAction::GiveUp => return Err(err),
            }
        }
    }
}

impl ActivityRuntime {
    /// 同步活动（文件读写、SQLite）放到阻塞线程池执行，超时照常生效
    ///
    /// 超时后阻塞线程不会被打断，活动必须幂等。
    pub async fn execute_blocking<T, F>(&self, activity: &str, op: F) -> Result<T, ActivityError>
    where
        F: FnOnce() -> Result<T, ActivityError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        self.execute(activity, || {
            let op = op.clone();
            let activity = activity.to_string();
            async move {
                match tokio::task::spawn_blocking(op).await {
                    Ok(result) => result,
                    Err(e) => Err(ActivityError::Rejected(format!("{activity} activity panicked: {e}"))),
                }
            }
        })
        .await
    }
}

impl Default for ActivityRuntime {
    fn default() -> Self {
        Self::from_config(&RuntimeSection::default())
    }
}
