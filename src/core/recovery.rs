//! 错误恢复引擎
//!
//! 根据工具错误与已尝试次数返回 RecoveryAction，供执行器决定是重试、重规划、询问人工还是终止会话。

use crate::config::OrchestratorConfig;
use crate::core::{FailureClass, TerminalReason};
use crate::tools::{ToolError, ToolErrorKind};

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 同参数重新派发
    Retry,
    /// 以失败上下文请求重规划
    Replan(String),
    /// 挂起步骤并向人工提问
    AskUser(String),
    /// 终止会话
    Abort(TerminalReason),
}

/// 将步骤失败映射为可执行动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_retries: u32,
    human_intervention: bool,
}

impl RecoveryEngine {
    pub fn new(max_retries: u32, human_intervention: bool) -> Self {
        Self {
            max_retries,
            human_intervention,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.max_retries, config.human_intervention)
    }

    /// attempts 为该步骤已执行的次数（含本次失败）；重试次数用尽的 Retryable 升级为重规划
    pub fn handle(&self, err: &ToolError, attempts: u32) -> RecoveryAction {
        match err.kind {
            ToolErrorKind::Ambiguous if self.human_intervention => {
                RecoveryAction::AskUser(err.message.clone())
            }
            ToolErrorKind::SandboxViolation => RecoveryAction::Abort(TerminalReason::SandboxViolation),
            kind => match kind.class() {
                FailureClass::Retryable if attempts <= self.max_retries => RecoveryAction::Retry,
                FailureClass::Retryable | FailureClass::Replannable => {
                    RecoveryAction::Replan(format!("{:?} failure after {attempts} attempt(s): {}", kind, err.message))
                }
                FailureClass::Fatal => RecoveryAction::Abort(TerminalReason::ToolFatal),
            },
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_retry_until_budget() {
        let engine = RecoveryEngine::new(2, true);
        let err = ToolError::retryable("rate limited");
        assert_eq!(engine.handle(&err, 1), RecoveryAction::Retry);
        assert_eq!(engine.handle(&err, 2), RecoveryAction::Retry);
        assert!(matches!(engine.handle(&err, 3), RecoveryAction::Replan(_)));
    }

    #[test]
    fn test_recovery_replannable() {
        let engine = RecoveryEngine::default();
        let err = ToolError::replannable("no results");
        match engine.handle(&err, 1) {
            RecoveryAction::Replan(ctx) => assert!(ctx.contains("no results")),
            other => panic!("Expected Replan, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_fatal_kinds() {
        let engine = RecoveryEngine::default();
        assert_eq!(
            engine.handle(&ToolError::timeout("search"), 1),
            RecoveryAction::Abort(TerminalReason::ToolFatal)
        );
        assert_eq!(
            engine.handle(&ToolError::invalid_parameters("bad"), 1),
            RecoveryAction::Abort(TerminalReason::ToolFatal)
        );
        assert_eq!(
            engine.handle(&ToolError::sandbox_violation("file://"), 1),
            RecoveryAction::Abort(TerminalReason::SandboxViolation)
        );
    }

    #[test]
    fn test_recovery_ambiguous() {
        let with_gate = RecoveryEngine::new(2, true);
        let err = ToolError::ambiguous("Which Springfield?");
        assert_eq!(
            with_gate.handle(&err, 1),
            RecoveryAction::AskUser("Which Springfield?".to_string())
        );

        let without_gate = RecoveryEngine::new(2, false);
        assert!(matches!(without_gate.handle(&err, 1), RecoveryAction::Replan(_)));
    }
}
