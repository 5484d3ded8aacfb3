//! 会话监管：取消令牌
//!
//! 每个会话持有一个 CancellationToken；cancel() 只发信号，执行器停止派发新步骤并等待在途调用自然结束。

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（幂等）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent_and_shared() {
        let supervisor = SessionSupervisor::new();
        let token = supervisor.clone().cancel_token();
        assert!(!supervisor.is_cancelled());

        supervisor.cancel();
        supervisor.cancel();
        assert!(supervisor.is_cancelled());
        assert!(token.is_cancelled());
    }
}
