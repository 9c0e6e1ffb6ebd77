//! 任务调度：活动工作池
//!
//! 所有活动（解析、嵌入、检索、生成……）共享一个 Semaphore，限制同时执行的数量；
//! 编排循环本身不占用许可，因此查询永远不会被活动阻塞。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::ActivityError;

/// 任务调度器：可克隆，克隆体共享同一个工作池
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    pool: Arc<Semaphore>,
    capacity: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let capacity = max_concurrent.max(1);
        Self {
            pool: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 获取活动执行许可；许可随返回值 drop 释放
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, ActivityError> {
        self.pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ActivityError::Transient("activity worker pool closed".into()))
    }

    pub fn available(&self) -> usize {
        self.pool.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}
