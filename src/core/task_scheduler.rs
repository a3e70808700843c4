//! 能力调用调度
//!
//! 所有 handler 的外部能力调用共享一个 Semaphore，限制同时在途的调用数（默认 3）。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 默认并发能力调用数
pub const DEFAULT_MAX_CONCURRENT_CAPABILITIES: usize = 3;

/// 任务调度器
#[derive(Debug)]
pub struct TaskScheduler {
    capability_semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_capabilities: usize) -> Self {
        let max = max_concurrent_capabilities.max(1);
        Self {
            capability_semaphore: Arc::new(Semaphore::new(max)),
            max_concurrent: max,
        }
    }

    /// 获取能力执行许可；信号量已关闭时返回 None
    pub async fn acquire_capability(&self) -> Option<OwnedSemaphorePermit> {
        self.capability_semaphore.clone().acquire_owned().await.ok()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 当前空闲许可数
    pub fn available(&self) -> usize {
        self.capability_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_CAPABILITIES)
    }
}
