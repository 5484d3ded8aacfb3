//! ActionExecutor：单个会话的执行循环
//!
//! 循环是会话唯一的写者：晋升 Pending→Ready，按信号量许可派发 Ready→Running，
//! 工具 worker 与人工等待者通过 mpsc 回报结果，由循环统一落记录。
//! 每次转移先追加到 ExecutionRecorder，再把返回的记录 apply 到本地状态与对外发布的状态。
//!
//! 停止派发的原因（Halt）：重规划、致命失败、取消、截止时间。停止后等在途步骤全部落定再处理。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::config::OrchestratorConfig;
use crate::context::Exchange;
use crate::core::{
    OrchestratorError, PlanningError, RecorderError, RecoveryAction, RecoveryEngine,
    SessionState, SessionStatus, SessionSupervisor, TaskScheduler, TerminalReason,
};
use crate::human::{HumanInterventionGate, HumanOutcome, RequestId};
use crate::plan::{
    ParamBinding, Plan, PlanGraph, PlanStep, SessionId, StepFailure, StepId, StepSpec, StepState,
    Task,
};
use crate::planner::PlanRefinementEngine;
use crate::recorder::{ExecutionRecorder, RecordEvent};
use crate::sandbox::{ToolInvocation, ToolResponse, ToolSandbox};
use crate::tools::{ToolError, ToolErrorKind};

/// 所有会话共享的组件
#[derive(Clone)]
pub struct SharedServices {
    pub recorder: Arc<ExecutionRecorder>,
    pub sandbox: Arc<ToolSandbox>,
    pub planner: Arc<PlanRefinementEngine>,
    pub gate: Arc<HumanInterventionGate>,
    pub config: OrchestratorConfig,
}

/// 会话结束状态
#[derive(Debug, Clone, PartialEq)]
pub struct SessionExit {
    pub status: SessionStatus,
    pub reason: Option<TerminalReason>,
    pub message: Option<String>,
    /// 执行器本地折叠出的最终状态
    pub state: SessionState,
}

enum StepEvent {
    Tool {
        step_id: StepId,
        response: ToolResponse,
    },
    Human {
        step_id: StepId,
        request_id: RequestId,
        question: String,
        outcome: HumanOutcome,
    },
}

enum Halt {
    Replan(String),
    Fail(TerminalReason, String),
    Cancel,
    Deadline,
}

pub struct ActionExecutor {
    session_id: SessionId,
    task: Arc<Task>,
    context: Vec<Exchange>,
    services: SharedServices,
    supervisor: SessionSupervisor,
    published: Arc<RwLock<SessionState>>,
    state: SessionState,
    recovery: RecoveryEngine,
    scheduler: TaskScheduler,
    events: mpsc::UnboundedSender<StepEvent>,
    inbox: Option<mpsc::UnboundedReceiver<StepEvent>>,
    /// 在途单元：沙箱 worker 与人工等待者
    in_flight: usize,
    halt: Option<Halt>,
    cancel_seen: bool,
    open_requests: HashMap<StepId, RequestId>,
    human_timed_out: bool,
}

impl ActionExecutor {
    pub fn new(
        session_id: SessionId,
        task: Arc<Task>,
        context: Vec<Exchange>,
        services: SharedServices,
        supervisor: SessionSupervisor,
        published: Arc<RwLock<SessionState>>,
    ) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        let recovery = RecoveryEngine::from_config(&services.config);
        let scheduler = TaskScheduler::new(services.config.max_parallelism);
        Self {
            state: SessionState::new(session_id.clone()),
            session_id,
            task,
            context,
            services,
            supervisor,
            published,
            recovery,
            scheduler,
            events,
            inbox: Some(inbox),
            in_flight: 0,
            halt: None,
            cancel_seen: false,
            open_requests: HashMap::new(),
            human_timed_out: false,
        }
    }

    /// 运行到会话终态
    pub async fn run(mut self) -> Result<SessionExit, OrchestratorError> {
        tracing::info!(session = %self.session_id, goal = %self.task.goal, "session started");
        let Some(mut inbox) = self.inbox.take() else {
            return Err(OrchestratorError::SessionJoin("executor already ran".to_string()));
        };
        let cancel = self.supervisor.cancel_token();

        let plan = match self
            .services
            .planner
            .generate(&self.task, &self.context)
            .await
        {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(session = %self.session_id, error = %e, "initial planning failed");
                return self
                    .finish(
                        SessionStatus::Failed,
                        Some(TerminalReason::PlanningFailure),
                        Some(e.to_string()),
                    )
                    .await;
            }
        };
        self.commit(RecordEvent::PlanRevised { plan, reason: None })
            .await?;

        let deadline_at = self.task.deadline.map(|deadline| {
            let remaining = (deadline - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            Instant::now() + remaining
        });
        let deadline_sleep = tokio::time::sleep_until(
            deadline_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 3600)),
        );
        tokio::pin!(deadline_sleep);
        let mut deadline_fired = false;

        loop {
            if !self.cancel_seen && cancel.is_cancelled() {
                self.on_cancel();
            }
            if self.halt.is_none() {
                self.promote().await?;
                self.launch().await?;
            }

            if self.in_flight == 0 {
                match self.halt.take() {
                    Some(Halt::Replan(failure)) => {
                        if let Some(exit) = self.replan(failure).await? {
                            return Ok(exit);
                        }
                        continue;
                    }
                    Some(Halt::Fail(reason, message)) => {
                        self.skip_remaining().await?;
                        return self
                            .finish(SessionStatus::Failed, Some(reason), Some(message))
                            .await;
                    }
                    Some(Halt::Cancel) => {
                        self.skip_remaining().await?;
                        return self
                            .finish(SessionStatus::Aborted, Some(TerminalReason::Cancelled), None)
                            .await;
                    }
                    Some(Halt::Deadline) => {
                        self.skip_remaining().await?;
                        return self
                            .finish(
                                SessionStatus::Failed,
                                Some(TerminalReason::DeadlineExceeded),
                                None,
                            )
                            .await;
                    }
                    None => {
                        let plan = self.plan()?;
                        let runnable = plan.steps.iter().any(|s| s.state == StepState::Ready)
                            || !PlanGraph::promotable(plan).is_empty();
                        if runnable {
                            continue;
                        }
                        return self.conclude().await;
                    }
                }
            }

            tokio::select! {
                Some(event) = inbox.recv() => match event {
                    StepEvent::Tool { step_id, response } => {
                        self.in_flight -= 1;
                        self.on_tool_result(&step_id, response).await?;
                    }
                    StepEvent::Human { step_id, request_id, question, outcome } => {
                        self.in_flight -= 1;
                        self.on_human_outcome(&step_id, request_id, question, outcome).await?;
                    }
                },
                _ = cancel.cancelled(), if !self.cancel_seen => self.on_cancel(),
                _ = &mut deadline_sleep, if deadline_at.is_some() && !deadline_fired => {
                    deadline_fired = true;
                    tracing::warn!(session = %self.session_id, "task deadline exceeded");
                    self.set_halt(Halt::Deadline);
                }
            }
        }
    }

    fn plan(&self) -> Result<&Plan, RecorderError> {
        self.state.plan.as_ref().ok_or_else(|| RecorderError::Corrupt {
            seq: self.state.last_seq,
            reason: "no active plan".to_string(),
        })
    }

    fn step(&self, id: &StepId) -> Result<&PlanStep, RecorderError> {
        self.plan()?.step(id).ok_or_else(|| RecorderError::Corrupt {
            seq: self.state.last_seq,
            reason: format!("unknown step {id}"),
        })
    }

    /// 先落记录，再应用到本地与发布状态
    async fn commit(&mut self, event: RecordEvent) -> Result<(), OrchestratorError> {
        let entry = self.services.recorder.append(&self.session_id, event)?;
        self.state.apply(&entry)?;
        self.published.write().await.apply(&entry)?;
        Ok(())
    }

    async fn transition(
        &mut self,
        id: &StepId,
        to: StepState,
        edit: impl FnOnce(&mut PlanStep) + Send,
    ) -> Result<(), OrchestratorError> {
        let mut next = self.step(id)?.clone();
        let from = next.state;
        next.state = to;
        edit(&mut next);
        tracing::debug!(session = %self.session_id, step = %id, ?from, ?to, "step transition");
        self.commit(RecordEvent::StepStateChanged {
            step_id: id.clone(),
            from,
            to,
            attempts: next.attempts,
            output: next.output,
            error: next.error,
        })
        .await
    }

    fn set_halt(&mut self, halt: Halt) {
        let replace = match (&self.halt, &halt) {
            (None, _) => true,
            (Some(Halt::Replan(_)), Halt::Replan(_)) => false,
            (Some(Halt::Replan(_)), _) => true,
            _ => false,
        };
        if replace {
            self.halt = Some(halt);
        }
        // 取消时撤回未决的人工请求；其它停止原因等待其自然结束
        if matches!(self.halt, Some(Halt::Cancel)) {
            for request_id in self.open_requests.values() {
                let _ = self.services.gate.withdraw(request_id);
            }
        }
    }

    fn on_cancel(&mut self) {
        self.cancel_seen = true;
        tracing::info!(session = %self.session_id, in_flight = self.in_flight, "cancellation requested");
        self.set_halt(Halt::Cancel);
    }

    async fn promote(&mut self) -> Result<(), OrchestratorError> {
        for id in PlanGraph::promotable(self.plan()?) {
            self.transition(&id, StepState::Ready, |_| {}).await?;
        }
        Ok(())
    }

    async fn launch(&mut self) -> Result<(), OrchestratorError> {
        let ready: Vec<StepId> = self
            .plan()?
            .steps
            .iter()
            .filter(|s| s.state == StepState::Ready)
            .map(|s| s.id().clone())
            .collect();

        for id in ready {
            if self.halt.is_some() {
                break;
            }
            let Some(permit) = self.scheduler.try_acquire_step() else {
                break;
            };
            self.transition(&id, StepState::Running, |s| {
                s.attempts += 1;
                s.error = None;
            })
            .await?;

            let (spec, args) = {
                let plan = self.plan()?;
                let spec = self.step(&id)?.spec.clone();
                let args = resolve_args(plan, &spec);
                (spec, args)
            };
            match args {
                Err(err) => {
                    drop(permit);
                    self.on_failure(&id, err).await?;
                }
                Ok(params) => {
                    let request = ToolInvocation {
                        tool: spec.binding.tool.clone(),
                        params,
                        step_id: id.clone(),
                    };
                    let sandbox = self.services.sandbox.clone();
                    let capabilities = self.task.allowed_tools.clone();
                    let events = self.events.clone();
                    self.in_flight += 1;
                    tokio::spawn(async move {
                        let _permit = permit;
                        let response = sandbox.invoke(request, &capabilities).await;
                        let _ = events.send(StepEvent::Tool {
                            step_id: id,
                            response,
                        });
                    });
                }
            }
        }
        Ok(())
    }

    async fn on_tool_result(
        &mut self,
        id: &StepId,
        response: ToolResponse,
    ) -> Result<(), OrchestratorError> {
        let output = match response.into_result() {
            Ok(output) => output,
            Err(err) => return self.on_failure(id, err).await,
        };

        let spec = self.step(id)?.spec.clone();
        match spec.postcondition.as_ref().filter(|pc| !pc.holds(&output)) {
            Some(postcondition) => {
                let err = ToolError::replannable(format!(
                    "postcondition {postcondition:?} not satisfied"
                ));
                tracing::warn!(session = %self.session_id, step = %spec.label, "postcondition violated");
                self.transition(id, StepState::Failed, |s| {
                    s.output = Some(output);
                    s.error = Some(step_failure(&err));
                })
                .await?;
                self.set_halt(Halt::Replan(format!("step '{}': {}", spec.label, err.message)));
            }
            None => {
                self.transition(id, StepState::Succeeded, |s| {
                    s.output = Some(output);
                    s.error = None;
                })
                .await?;
            }
        }
        Ok(())
    }

    /// 失败先落记录（Running→Failed），再按恢复动作处理；歧义输出转人工
    async fn on_failure(&mut self, id: &StepId, err: ToolError) -> Result<(), OrchestratorError> {
        if err.kind == ToolErrorKind::Ambiguous
            && self.services.config.human_intervention
            && self.halt.is_none()
        {
            return self.ask_human(id, err).await;
        }

        let label = self.step(id)?.spec.label.clone();
        tracing::warn!(session = %self.session_id, step = %label, error = %err, "step failed");
        self.transition(id, StepState::Failed, |s| s.error = Some(step_failure(&err)))
            .await?;
        let attempts = self.step(id)?.attempts;

        match self.recovery.handle(&err, attempts) {
            RecoveryAction::Retry => {
                if self.halt.is_none() {
                    tracing::info!(session = %self.session_id, step = %label, attempts, "retrying step");
                    self.transition(id, StepState::Ready, |_| {}).await?;
                }
            }
            RecoveryAction::Replan(context) | RecoveryAction::AskUser(context) => {
                self.set_halt(Halt::Replan(format!("step '{label}' failed: {context}")));
            }
            RecoveryAction::Abort(reason) => {
                self.set_halt(Halt::Fail(reason, format!("step '{label}' failed: {err}")));
            }
        }
        Ok(())
    }

    async fn ask_human(&mut self, id: &StepId, err: ToolError) -> Result<(), OrchestratorError> {
        let handle = match self.services.gate.request(
            &self.session_id,
            id,
            err.message.clone(),
            self.services.config.human_deadline,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(session = %self.session_id, step = %id, error = %e, "human request refused");
                let label = self.step(id)?.spec.label.clone();
                self.transition(id, StepState::Failed, |s| s.error = Some(step_failure(&err)))
                    .await?;
                self.set_halt(Halt::Replan(format!(
                    "step '{label}' needs clarification but no human request could be opened: {e}"
                )));
                return Ok(());
            }
        };

        self.commit(RecordEvent::HumanRequested {
            request_id: handle.request_id.clone(),
            step_id: id.clone(),
            question: handle.question.clone(),
            deadline_ms: handle.deadline_ms,
        })
        .await?;
        self.open_requests
            .insert(id.clone(), handle.request_id.clone());

        let gate = self.services.gate.clone();
        let events = self.events.clone();
        let step_id = id.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let request_id = handle.request_id.clone();
            let question = handle.question.clone();
            let outcome = gate.wait(handle).await;
            let _ = events.send(StepEvent::Human {
                step_id,
                request_id,
                question,
                outcome,
            });
        });
        Ok(())
    }

    async fn on_human_outcome(
        &mut self,
        id: &StepId,
        request_id: RequestId,
        question: String,
        outcome: HumanOutcome,
    ) -> Result<(), OrchestratorError> {
        self.open_requests.remove(id);
        let outcome = match outcome {
            HumanOutcome::Pending => HumanOutcome::Withdrawn,
            other => other,
        };
        self.commit(RecordEvent::HumanAnswered {
            request_id,
            step_id: id.clone(),
            outcome: outcome.clone(),
        })
        .await?;

        match outcome {
            HumanOutcome::Answered(payload) => {
                self.transition(id, StepState::Succeeded, |s| {
                    s.output = Some(json!({ "tool_output": question, "human": payload }));
                    s.error = None;
                })
                .await
            }
            HumanOutcome::TimedOut => {
                tracing::warn!(session = %self.session_id, step = %id, "human request timed out");
                self.human_timed_out = true;
                self.transition(id, StepState::Failed, |s| {
                    s.error = Some(StepFailure {
                        kind: ToolErrorKind::Ambiguous,
                        message: "human response timed out".to_string(),
                    });
                })
                .await?;
                let dependents = PlanGraph::new(self.plan()?).dependents_closure(id);
                for dependent in dependents {
                    if matches!(
                        self.step(&dependent)?.state,
                        StepState::Pending | StepState::Ready
                    ) {
                        self.transition(&dependent, StepState::Skipped, |_| {})
                            .await?;
                    }
                }
                Ok(())
            }
            HumanOutcome::Withdrawn | HumanOutcome::Pending => {
                self.transition(id, StepState::Skipped, |_| {}).await
            }
        }
    }

    /// 在途全部落定后重规划；返回 Some 表示会话结束
    async fn replan(&mut self, failure: String) -> Result<Option<SessionExit>, OrchestratorError> {
        let current = self.plan()?.clone();
        tracing::info!(session = %self.session_id, revision = current.revision, failure = %failure, "replanning");

        match self
            .services
            .planner
            .refine(&self.task, &self.context, &current, &failure)
            .await
        {
            Ok(next) => {
                self.commit(RecordEvent::PlanRevised {
                    plan: next,
                    reason: Some(failure),
                })
                .await?;
                Ok(None)
            }
            Err(e) => {
                let reason = match e {
                    PlanningError::RefinementsExhausted(_) => TerminalReason::PlanningExhausted,
                    _ => TerminalReason::PlanningFailure,
                };
                tracing::warn!(session = %self.session_id, error = %e, "refinement failed");
                self.skip_remaining().await?;
                self.finish(SessionStatus::Failed, Some(reason), Some(e.to_string()))
                    .await
                    .map(Some)
            }
        }
    }

    async fn skip_remaining(&mut self) -> Result<(), OrchestratorError> {
        let remaining: Vec<StepId> = self
            .plan()
            .map(|plan| {
                plan.steps
                    .iter()
                    .filter(|s| matches!(s.state, StepState::Pending | StepState::Ready))
                    .map(|s| s.id().clone())
                    .collect()
            })
            .unwrap_or_default();
        for id in remaining {
            self.transition(&id, StepState::Skipped, |_| {}).await?;
        }
        Ok(())
    }

    /// 无在途、无可派发步骤时的收尾
    async fn conclude(&mut self) -> Result<SessionExit, OrchestratorError> {
        // 依赖永远无法满足的步骤
        self.skip_remaining().await?;
        let failed = self.plan()?.count_in(StepState::Failed) > 0;
        if self.human_timed_out {
            self.finish(
                SessionStatus::Failed,
                Some(TerminalReason::HumanTimeout),
                Some("a human request timed out".to_string()),
            )
            .await
        } else if failed {
            self.finish(SessionStatus::Failed, Some(TerminalReason::ToolFatal), None)
                .await
        } else {
            self.finish(SessionStatus::Completed, None, None).await
        }
    }

    async fn finish(
        &mut self,
        status: SessionStatus,
        reason: Option<TerminalReason>,
        message: Option<String>,
    ) -> Result<SessionExit, OrchestratorError> {
        self.commit(RecordEvent::SessionTerminal {
            status,
            reason,
            message: message.clone(),
        })
        .await?;
        match reason {
            Some(reason) => {
                tracing::info!(session = %self.session_id, ?status, %reason, "session finished")
            }
            None => tracing::info!(session = %self.session_id, ?status, "session finished"),
        }
        Ok(SessionExit {
            status,
            reason,
            message,
            state: self.state.clone(),
        })
    }
}

fn step_failure(err: &ToolError) -> StepFailure {
    StepFailure {
        kind: err.kind,
        message: err.message.clone(),
    }
}

/// 用依赖步骤的输出填充参数绑定
fn resolve_args(plan: &Plan, spec: &StepSpec) -> Result<Map<String, Value>, ToolError> {
    let mut args = Map::new();
    for (key, binding) in &spec.binding.params {
        let value = match binding {
            ParamBinding::Literal { value } => value.clone(),
            ParamBinding::StepOutput { step, field } => {
                let output = plan
                    .step(step)
                    .and_then(|s| s.output.as_ref())
                    .ok_or_else(|| ToolError::replannable(format!("step {step} has no output")))?;
                match field {
                    Some(field) => output.get(field).cloned().ok_or_else(|| {
                        ToolError::replannable(format!("output of {step} has no field '{field}'"))
                    })?,
                    None => output.clone(),
                }
            }
        };
        args.insert(key.clone(), value);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::resolve_drafts;
    use crate::plan::StepDraft;

    #[test]
    fn test_resolve_args_reads_dependency_output() {
        let mut plan = resolve_drafts(
            &[
                StepDraft::new("fetch", "echo").param("text", "x"),
                StepDraft::new("sum", "echo").bind_field("text", "fetch", Some("body")),
            ],
            None,
        )
        .unwrap();
        let fetch = plan.step_by_label("fetch").unwrap().id().clone();
        let spec = plan.step_by_label("sum").unwrap().spec.clone();

        assert!(resolve_args(&plan, &spec).is_err());

        plan.step_mut(&fetch).unwrap().output = Some(json!({"body": "sunny"}));
        let args = resolve_args(&plan, &spec).unwrap();
        assert_eq!(args["text"], json!("sunny"));

        plan.step_mut(&fetch).unwrap().output = Some(json!({"other": 1}));
        assert_eq!(
            resolve_args(&plan, &spec).unwrap_err().kind,
            ToolErrorKind::Replannable
        );
    }
}
