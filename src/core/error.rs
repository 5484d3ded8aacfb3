//! 编排错误类型、失败分类与会话终止原因
//!
//! 与 RecoveryEngine 配合：步骤级错误在执行器内部消化，只有会话终态（附带终止原因）会暴露给调用方。

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::{PlanError, SessionId, StepId};

/// 工具失败的三类处置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// 同参数重试
    Retryable,
    /// 请求规划器重规划
    Replannable,
    /// 会话失败
    Fatal,
}

/// 会话终态原因（写入 SessionTerminal 记录）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalReason {
    /// 工具致命失败（含超时、参数非法）
    ToolFatal,
    SandboxViolation,
    HumanTimeout,
    /// 重规划次数用尽
    PlanningExhausted,
    /// 无法生成合法计划
    PlanningFailure,
    DeadlineExceeded,
    Cancelled,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalReason::ToolFatal => "ToolExecutionFailure:Fatal",
            TerminalReason::SandboxViolation => "SandboxViolation",
            TerminalReason::HumanTimeout => "HumanTimeout",
            TerminalReason::PlanningExhausted => "PlanningExhausted",
            TerminalReason::PlanningFailure => "PlanningFailure",
            TerminalReason::DeadlineExceeded => "DeadlineExceeded",
            TerminalReason::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// 规划错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanningError {
    #[error("Planning strategy failed: {0}")]
    Strategy(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    /// 评审驳回次数用尽，附最后一次驳回原因
    #[error("No valid plan after {attempts} attempts: {last}")]
    AttemptsExhausted { attempts: u32, last: String },

    #[error("Refinement budget exhausted after {0} refinements")]
    RefinementsExhausted(u32),

    #[error("LLM error: {0}")]
    Llm(String),
}

/// 执行记录存储错误
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No records for session {0}")]
    NoRecords(SessionId),

    /// 记录与当前状态不一致（回放时发现）
    #[error("Corrupt record at seq {seq}: {reason}")]
    Corrupt { seq: u64, reason: String },

    #[error("Recorder lock poisoned")]
    Poisoned,
}

/// 对调用方暴露的编排错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Human request closed: {0}")]
    RequestClosed(String),

    #[error("Unknown human request: {0}")]
    UnknownRequest(String),

    #[error("Step {0} already has a pending human request")]
    RequestConflict(StepId),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Planning failed: {0}")]
    Planning(#[from] PlanningError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Session task aborted: {0}")]
    SessionJoin(String),
}
