//! 执行记录条目
//!
//! 持久化布局固定为 `{session_id, seq, timestamp, kind, payload}`，是 replay 的唯一输入。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{SessionStatus, TerminalReason};
use crate::human::{HumanOutcome, RequestId};
use crate::plan::{Plan, SessionId, StepFailure, StepId, StepState};

/// 可观测的状态转移
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum RecordEvent {
    /// 新的计划修订（携带完整计划，回放时不重新规划）
    PlanRevised {
        plan: Plan,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// 步骤状态变化，携带变化后的完整生命周期字段
    StepStateChanged {
        step_id: StepId,
        from: StepState,
        to: StepState,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<StepFailure>,
    },
    HumanRequested {
        request_id: RequestId,
        step_id: StepId,
        question: String,
        deadline_ms: i64,
    },
    /// 人工请求落定：回答、超时或撤回
    HumanAnswered {
        request_id: RequestId,
        step_id: StepId,
        outcome: HumanOutcome,
    },
    SessionTerminal {
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<TerminalReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl RecordEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordEvent::PlanRevised { .. } => "PlanRevised",
            RecordEvent::StepStateChanged { .. } => "StepStateChanged",
            RecordEvent::HumanRequested { .. } => "HumanRequested",
            RecordEvent::HumanAnswered { .. } => "HumanAnswered",
            RecordEvent::SessionTerminal { .. } => "SessionTerminal",
        }
    }

    /// 拆分为 (kind, payload)，供按列存储
    pub fn into_parts(self) -> Result<(String, Value), serde_json::Error> {
        let kind = self.kind().to_string();
        let mut value = serde_json::to_value(self)?;
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok((kind, payload))
    }

    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "kind": kind, "payload": payload }))
    }
}

/// 一条执行记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub session_id: SessionId,
    /// 会话内单调递增，从 1 开始
    pub seq: u64,
    /// 毫秒时间戳
    pub timestamp: i64,
    #[serde(flatten)]
    pub event: RecordEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_persisted_layout() {
        let entry = RecordEntry {
            session_id: "sess_1".into(),
            seq: 3,
            timestamp: 1_700_000_000_000,
            event: RecordEvent::SessionTerminal {
                status: SessionStatus::Failed,
                reason: Some(TerminalReason::HumanTimeout),
                message: None,
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["session_id"], "sess_1");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["kind"], "SessionTerminal");
        assert_eq!(value["payload"]["status"], "Failed");
        assert_eq!(value["payload"]["reason"], "HumanTimeout");

        let back: RecordEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_parts_split() {
        let event = RecordEvent::HumanAnswered {
            request_id: "human_1".into(),
            step_id: StepId::new("step_a"),
            outcome: HumanOutcome::Answered(json!("Paris")),
        };
        let (kind, payload) = event.clone().into_parts().unwrap();
        assert_eq!(kind, "HumanAnswered");
        assert_eq!(payload["outcome"]["status"], "Answered");
        assert_eq!(RecordEvent::from_parts(&kind, payload).unwrap(), event);
    }
}
