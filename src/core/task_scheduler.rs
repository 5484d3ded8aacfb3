//! 步骤调度许可
//!
//! 每个会话一个 Semaphore，限制同时在沙箱中执行的步骤数；许可随 worker 一起移动，执行结束即释放。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 会话内的并发上限
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    step_semaphore: Arc<Semaphore>,
    max_parallelism: usize,
}

impl TaskScheduler {
    pub fn new(max_parallelism: usize) -> Self {
        let max_parallelism = max_parallelism.max(1);
        Self {
            step_semaphore: Arc::new(Semaphore::new(max_parallelism)),
            max_parallelism,
        }
    }

    /// 非阻塞获取许可；没有空闲许可时返回 None，调用方等待在途步骤完成后再试
    pub fn try_acquire_step(&self) -> Option<OwnedSemaphorePermit> {
        self.step_semaphore.clone().try_acquire_owned().ok()
    }

    /// 当前在途步骤数
    pub fn in_flight(&self) -> usize {
        self.max_parallelism - self.step_semaphore.available_permits()
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}
