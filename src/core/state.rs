//! 会话状态：执行记录的折叠结果
//!
//! 执行器先把事件交给 ExecutionRecorder 追加，再把返回的记录 apply 到这里；
//! replay 对同一组记录做同样的 apply，所以回放状态与现场状态逐字节一致。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{RecorderError, TerminalReason};
use crate::human::{HumanOutcome, RequestId};
use crate::plan::{Plan, SessionId, StepId, StepState};
use crate::recorder::{RecordEntry, RecordEvent};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// 单个计划修订的摘要：修订号、原因与该修订引用的步骤 ID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRevisionSummary {
    pub revision: u32,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub steps: Vec<StepId>,
}

/// 记录中的人工请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanRequestRecord {
    pub step_id: StepId,
    pub question: String,
    pub deadline_ms: i64,
    pub outcome: HumanOutcome,
}

/// 可回放的会话状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TerminalReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// 当前活动计划（首个 PlanRevised 之前为空）
    pub plan: Option<Plan>,
    pub revisions: Vec<PlanRevisionSummary>,
    pub human_requests: BTreeMap<RequestId, HumanRequestRecord>,
    pub last_seq: u64,
}

impl SessionState {
    pub fn new(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Running,
            reason: None,
            message: None,
            plan: None,
            revisions: Vec::new(),
            human_requests: BTreeMap::new(),
            last_seq: 0,
        }
    }

    pub fn revision(&self) -> Option<u32> {
        self.plan.as_ref().map(|p| p.revision)
    }

    pub fn step_state(&self, id: &StepId) -> Option<StepState> {
        self.plan.as_ref().and_then(|p| p.step(id)).map(|s| s.state)
    }

    /// 折叠一条记录；序号必须连续
    pub fn apply(&mut self, entry: &RecordEntry) -> Result<(), RecorderError> {
        let corrupt = |reason: String| RecorderError::Corrupt {
            seq: entry.seq,
            reason,
        };

        if entry.session_id != self.session_id {
            return Err(corrupt(format!(
                "entry belongs to session {}",
                entry.session_id
            )));
        }
        if entry.seq != self.last_seq + 1 {
            return Err(corrupt(format!("expected seq {}", self.last_seq + 1)));
        }
        if self.status.is_terminal() {
            return Err(corrupt("session already terminal".to_string()));
        }

        match &entry.event {
            RecordEvent::PlanRevised { plan, reason } => {
                if let Some(current) = &self.plan {
                    if plan.revision != current.revision + 1 {
                        return Err(corrupt(format!(
                            "revision {} does not follow {}",
                            plan.revision, current.revision
                        )));
                    }
                }
                self.revisions.push(PlanRevisionSummary {
                    revision: plan.revision,
                    seq: entry.seq,
                    reason: reason.clone(),
                    steps: plan.ids(),
                });
                self.plan = Some(plan.clone());
            }
            RecordEvent::StepStateChanged {
                step_id,
                from,
                to,
                attempts,
                output,
                error,
            } => {
                let step = self
                    .plan
                    .as_mut()
                    .and_then(|p| p.step_mut(step_id))
                    .ok_or_else(|| corrupt(format!("unknown step {step_id}")))?;
                if step.state != *from {
                    return Err(corrupt(format!(
                        "step {step_id} is {:?}, not {:?}",
                        step.state, from
                    )));
                }
                step.state = *to;
                step.attempts = *attempts;
                step.output = output.clone();
                step.error = error.clone();
            }
            RecordEvent::HumanRequested {
                request_id,
                step_id,
                question,
                deadline_ms,
            } => {
                self.human_requests.insert(
                    request_id.clone(),
                    HumanRequestRecord {
                        step_id: step_id.clone(),
                        question: question.clone(),
                        deadline_ms: *deadline_ms,
                        outcome: HumanOutcome::Pending,
                    },
                );
            }
            RecordEvent::HumanAnswered {
                request_id,
                outcome,
                ..
            } => {
                let request = self
                    .human_requests
                    .get_mut(request_id)
                    .ok_or_else(|| corrupt(format!("unknown human request {request_id}")))?;
                request.outcome = outcome.clone();
            }
            RecordEvent::SessionTerminal {
                status,
                reason,
                message,
            } => {
                self.status = *status;
                self.reason = *reason;
                self.message = message.clone();
            }
        }

        self.last_seq = entry.seq;
        Ok(())
    }
}
