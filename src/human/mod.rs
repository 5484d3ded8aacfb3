//! 人工介入闸门
//!
//! 为单个步骤挂起一个人工请求：Pending → Answered(payload) | TimedOut（会话取消时为 Withdrawn）。
//! 每个步骤同一时刻最多一个未决请求；超时后的迟到回答返回 RequestClosed。
//! 等待方通过 watch 通道得到通知，不占用共享 worker。

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::OrchestratorError;
use crate::plan::{SessionId, StepId};

pub type RequestId = String;

/// 人工请求的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload")]
pub enum HumanOutcome {
    Pending,
    Answered(Value),
    TimedOut,
    /// 会话取消时撤回
    Withdrawn,
}

impl HumanOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, HumanOutcome::Pending)
    }
}

/// 对外展示的未决请求
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HumanRequestView {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub step_id: StepId,
    pub question: String,
    /// 截止时间（毫秒时间戳）
    pub deadline_ms: i64,
}

/// 请求句柄：持有者用 HumanInterventionGate::wait 等待结果
#[derive(Debug)]
pub struct HumanHandle {
    pub request_id: RequestId,
    pub session_id: SessionId,
    pub step_id: StepId,
    pub question: String,
    pub deadline_ms: i64,
    deadline: Instant,
    rx: watch::Receiver<HumanOutcome>,
}

struct RequestSlot {
    view: HumanRequestView,
    deadline: Instant,
    outcome: HumanOutcome,
    tx: watch::Sender<HumanOutcome>,
}

impl RequestSlot {
    fn settle(&mut self, outcome: HumanOutcome) {
        self.outcome = outcome.clone();
        let _ = self.tx.send(outcome);
    }

    /// 到期则转为 TimedOut
    fn expire_if_due(&mut self, now: Instant) {
        if self.outcome.is_pending() && now >= self.deadline {
            self.settle(HumanOutcome::TimedOut);
        }
    }
}

#[derive(Default)]
struct GateInner {
    requests: HashMap<RequestId, RequestSlot>,
    /// (会话, 步骤) -> 未决请求
    open: HashMap<(SessionId, StepId), RequestId>,
    /// 已结束会话的请求 ID，迟到的回答据此返回 RequestClosed
    retired: HashSet<RequestId>,
}

impl GateInner {
    fn close_if_settled(&mut self, request_id: &str) {
        if let Some(slot) = self.requests.get(request_id) {
            if !slot.outcome.is_pending() {
                let key = (slot.view.session_id.clone(), slot.view.step_id.clone());
                if self.open.get(&key).map(|id| id == request_id).unwrap_or(false) {
                    self.open.remove(&key);
                }
            }
        }
    }
}

/// 人工介入闸门
#[derive(Default)]
pub struct HumanInterventionGate {
    inner: Mutex<GateInner>,
}

impl HumanInterventionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 为步骤发起请求；同一步骤已有未决请求时返回 RequestConflict
    pub fn request(
        &self,
        session_id: &str,
        step_id: &StepId,
        question: impl Into<String>,
        deadline: Duration,
    ) -> Result<HumanHandle, OrchestratorError> {
        let mut inner = self.lock();
        let now = Instant::now();
        let key = (session_id.to_string(), step_id.clone());

        if let Some(existing) = inner.open.get(&key).cloned() {
            if let Some(slot) = inner.requests.get_mut(&existing) {
                slot.expire_if_due(now);
            }
            inner.close_if_settled(&existing);
            if inner.open.contains_key(&key) {
                return Err(OrchestratorError::RequestConflict(step_id.clone()));
            }
        }

        let request_id = format!("human_{}", uuid::Uuid::new_v4());
        let deadline_ms = chrono::Utc::now().timestamp_millis() + deadline.as_millis() as i64;
        let (tx, rx) = watch::channel(HumanOutcome::Pending);
        let view = HumanRequestView {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            step_id: step_id.clone(),
            question: question.into(),
            deadline_ms,
        };
        let handle = HumanHandle {
            request_id: request_id.clone(),
            session_id: view.session_id.clone(),
            step_id: step_id.clone(),
            question: view.question.clone(),
            deadline_ms,
            deadline: now + deadline,
            rx,
        };

        inner.requests.insert(
            request_id.clone(),
            RequestSlot {
                view,
                deadline: now + deadline,
                outcome: HumanOutcome::Pending,
                tx,
            },
        );
        inner.open.insert(key, request_id);
        tracing::info!(request = %handle.request_id, step = %step_id, "human request opened");
        Ok(handle)
    }

    /// 回答请求；已超时 / 已回答 / 已撤回时返回 RequestClosed
    pub fn answer(&self, request_id: &str, payload: Value) -> Result<(), OrchestratorError> {
        let mut inner = self.lock();
        if inner.retired.contains(request_id) {
            return Err(OrchestratorError::RequestClosed(request_id.to_string()));
        }
        let slot = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?;

        slot.expire_if_due(Instant::now());
        if !slot.outcome.is_pending() {
            inner.close_if_settled(request_id);
            return Err(OrchestratorError::RequestClosed(request_id.to_string()));
        }
        slot.settle(HumanOutcome::Answered(payload));
        inner.close_if_settled(request_id);
        tracing::info!(request = %request_id, "human request answered");
        Ok(())
    }

    /// 查询当前结果（到期的请求在此处转为 TimedOut）
    pub fn poll(&self, request_id: &str) -> Result<HumanOutcome, OrchestratorError> {
        let mut inner = self.lock();
        if inner.retired.contains(request_id) {
            return Err(OrchestratorError::RequestClosed(request_id.to_string()));
        }
        let slot = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?;
        slot.expire_if_due(Instant::now());
        let outcome = slot.outcome.clone();
        inner.close_if_settled(request_id);
        Ok(outcome)
    }

    /// 撤回未决请求；返回最终结果（若已回答则仍为 Answered）
    pub fn withdraw(&self, request_id: &str) -> Result<HumanOutcome, OrchestratorError> {
        let mut inner = self.lock();
        let slot = inner
            .requests
            .get_mut(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?;
        if slot.outcome.is_pending() {
            slot.settle(HumanOutcome::Withdrawn);
        }
        let outcome = slot.outcome.clone();
        inner.close_if_settled(request_id);
        Ok(outcome)
    }

    /// 等待回答或超时
    pub async fn wait(&self, mut handle: HumanHandle) -> HumanOutcome {
        loop {
            let current = handle.rx.borrow_and_update().clone();
            if !current.is_pending() {
                return current;
            }
            tokio::select! {
                changed = handle.rx.changed() => {
                    if changed.is_err() {
                        return self.poll(&handle.request_id).unwrap_or(HumanOutcome::Withdrawn);
                    }
                }
                _ = tokio::time::sleep_until(handle.deadline) => {
                    return self.poll(&handle.request_id).unwrap_or(HumanOutcome::TimedOut);
                }
            }
        }
    }

    /// 会话的未决请求
    pub fn pending(&self, session_id: &str) -> Vec<HumanRequestView> {
        let mut inner = self.lock();
        let now = Instant::now();
        let mut views: Vec<HumanRequestView> = Vec::new();
        let ids: Vec<RequestId> = inner
            .open
            .iter()
            .filter(|((session, _), _)| session == session_id)
            .map(|(_, id)| id.clone())
            .collect();
        for id in ids {
            if let Some(slot) = inner.requests.get_mut(&id) {
                slot.expire_if_due(now);
                if slot.outcome.is_pending() {
                    views.push(slot.view.clone());
                }
            }
            inner.close_if_settled(&id);
        }
        views.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        views
    }

    /// 会话结束后释放其请求槽位，只保留请求 ID 以便拒绝迟到的回答
    pub fn forget_session(&self, session_id: &str) {
        let mut inner = self.lock();
        let ids: Vec<RequestId> = inner
            .requests
            .iter()
            .filter(|(_, slot)| slot.view.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            inner.requests.remove(&id);
            inner.retired.insert(id);
        }
        inner.open.retain(|(session, _), _| session != session_id);
    }
}
