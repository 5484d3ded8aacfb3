//! 工具错误与失败分类
//!
//! 工具（或沙箱）返回 ToolError；执行器据 kind 决定重试、重规划、请求人工或终止。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::FailureClass;

/// 工具错误种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ToolErrorKind {
    /// 暂时性错误，同参数重试可能成功
    Retryable,
    /// 需要换一种做法（重规划）
    Replannable,
    /// 不可恢复
    Fatal,
    /// 输出有歧义，需要人工澄清
    Ambiguous,
    /// 沙箱超时
    Timeout,
    /// 参数不合法（未进入沙箱）
    InvalidParameters,
    /// 违反沙箱策略
    SandboxViolation,
}

impl ToolErrorKind {
    /// 映射到三类失败；Ambiguous 在不允许人工介入时按可重规划处理
    pub fn class(&self) -> FailureClass {
        match self {
            ToolErrorKind::Retryable => FailureClass::Retryable,
            ToolErrorKind::Replannable | ToolErrorKind::Ambiguous => FailureClass::Replannable,
            ToolErrorKind::Fatal
            | ToolErrorKind::Timeout
            | ToolErrorKind::InvalidParameters
            | ToolErrorKind::SandboxViolation => FailureClass::Fatal,
        }
    }
}

/// 工具执行错误
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Retryable, message)
    }

    pub fn replannable(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Replannable, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Fatal, message)
    }

    /// message 即向人工提出的问题
    pub fn ambiguous(question: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Ambiguous, question)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidParameters, message)
    }

    pub fn sandbox_violation(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::SandboxViolation, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(ToolErrorKind::Retryable.class(), FailureClass::Retryable);
        assert_eq!(ToolErrorKind::Timeout.class(), FailureClass::Fatal);
        assert_eq!(ToolErrorKind::SandboxViolation.class(), FailureClass::Fatal);
        assert_eq!(ToolErrorKind::InvalidParameters.class(), FailureClass::Fatal);
        assert_eq!(ToolErrorKind::Ambiguous.class(), FailureClass::Replannable);
    }

    #[test]
    fn test_display() {
        let err = ToolError::timeout("search timed out after 30s");
        assert_eq!(err.to_string(), "Timeout: search timed out after 30s");
    }
}
