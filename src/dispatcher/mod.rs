//! TaskDispatcher：编排入口
//!
//! submit 校验任务、分配会话 ID、登记现场槽位并派生会话任务后立即返回。
//! 会话终态落记录后槽位被移除，此后 status 通过回放执行记录提供。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::actor::{ActionExecutor, SessionExit, SharedServices};
use crate::config::{AppConfig, OrchestratorConfig, SandboxSection};
use crate::context::{ContextProvider, NoContext};
use crate::core::{
    OrchestratorError, RecorderError, SessionState, SessionStatus, SessionSupervisor,
    TerminalReason,
};
use crate::human::{HumanInterventionGate, HumanRequestView};
use crate::plan::{SessionId, Task};
use crate::planner::{PlanRefinementEngine, PlanningStrategy};
use crate::recorder::{ExecutionRecorder, RecordEntry};
use crate::sandbox::ToolSandbox;
use crate::tools::ToolRegistry;

/// 会话当前状态与最近的记录
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub tail: Vec<RecordEntry>,
}

/// 会话终态与完整轨迹
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub reason: Option<TerminalReason>,
    pub message: Option<String>,
    pub trace: Vec<RecordEntry>,
    pub state: SessionState,
}

/// submit 返回的句柄
pub struct SessionHandle {
    session_id: SessionId,
    join: JoinHandle<Result<SessionExit, OrchestratorError>>,
    recorder: Arc<ExecutionRecorder>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 等待会话结束
    pub async fn wait(self) -> Result<SessionOutcome, OrchestratorError> {
        let exit = self
            .join
            .await
            .map_err(|e| OrchestratorError::SessionJoin(e.to_string()))??;
        let trace = self.recorder.entries(&self.session_id)?;
        Ok(SessionOutcome {
            session_id: self.session_id,
            status: exit.status,
            reason: exit.reason,
            message: exit.message,
            trace,
            state: exit.state,
        })
    }
}

struct SessionSlot {
    supervisor: SessionSupervisor,
    state: Arc<tokio::sync::RwLock<SessionState>>,
}

type SessionTable = Arc<RwLock<HashMap<SessionId, SessionSlot>>>;

pub struct TaskDispatcher {
    services: SharedServices,
    context: Arc<dyn ContextProvider>,
    sessions: SessionTable,
}

impl TaskDispatcher {
    pub fn builder(
        registry: Arc<ToolRegistry>,
        strategy: Arc<dyn PlanningStrategy>,
    ) -> DispatcherBuilder {
        DispatcherBuilder::new(registry, strategy)
    }

    /// 校验任务并启动会话
    pub fn submit(&self, task: Task) -> Result<SessionHandle, OrchestratorError> {
        self.validate(&task)?;

        let session_id = format!("sess_{}", uuid::Uuid::new_v4().simple());
        let supervisor = SessionSupervisor::new();
        let state = Arc::new(tokio::sync::RwLock::new(SessionState::new(
            session_id.clone(),
        )));
        self.sessions
            .write()
            .map_err(|_| RecorderError::Poisoned)?
            .insert(
                session_id.clone(),
                SessionSlot {
                    supervisor: supervisor.clone(),
                    state: state.clone(),
                },
            );
        tracing::info!(session = %session_id, goal = %task.goal, tools = task.allowed_tools.len(), "task submitted");

        let services = self.services.clone();
        let context = self.context.clone();
        let sessions = self.sessions.clone();
        let id = session_id.clone();
        let join = tokio::spawn(async move {
            let exchanges = context.load_context(&id).await;
            let gate = services.gate.clone();
            let executor = ActionExecutor::new(
                id.clone(),
                Arc::new(task),
                exchanges,
                services,
                supervisor,
                state,
            );
            let exit = executor.run().await;
            if let Err(e) = &exit {
                tracing::error!(session = %id, error = %e, "session aborted by internal error");
            }
            if let Ok(mut table) = sessions.write() {
                table.remove(&id);
            }
            gate.forget_session(&id);
            exit
        });

        Ok(SessionHandle {
            session_id,
            join,
            recorder: self.services.recorder.clone(),
        })
    }

    fn validate(&self, task: &Task) -> Result<(), OrchestratorError> {
        if task.goal.trim().is_empty() {
            return Err(OrchestratorError::InvalidTask("goal is empty".to_string()));
        }
        let registry = self.services.sandbox.registry();
        if let Some(tool) = task.allowed_tools.iter().find(|t| !registry.contains(t)) {
            return Err(OrchestratorError::InvalidTask(format!(
                "tool '{tool}' is not registered"
            )));
        }
        if let Some(deadline) = task.deadline {
            if deadline <= chrono::Utc::now() {
                return Err(OrchestratorError::InvalidTask(
                    "deadline already passed".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn live_slot(
        &self,
        session_id: &str,
    ) -> Result<Option<(SessionSupervisor, Arc<tokio::sync::RwLock<SessionState>>)>, OrchestratorError>
    {
        let table = self.sessions.read().map_err(|_| RecorderError::Poisoned)?;
        Ok(table
            .get(session_id)
            .map(|slot| (slot.supervisor.clone(), slot.state.clone())))
    }

    fn known(&self, session_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self.services.recorder.last_seq(session_id)? > 0)
    }

    /// 现场状态（运行中）或回放状态（已结束），附最近的记录
    pub async fn status(&self, session_id: &str) -> Result<SessionSnapshot, OrchestratorError> {
        let recorder = &self.services.recorder;
        let state = match self.live_slot(session_id)? {
            Some((_, state)) => state.read().await.clone(),
            None => {
                if !self.known(session_id)? {
                    return Err(OrchestratorError::UnknownSession(session_id.to_string()));
                }
                recorder.replay(session_id)?
            }
        };
        // 记录先于发布，尾部只取已应用到状态的部分
        let tail = recorder
            .tail(session_id, self.services.config.status_tail + 1)?
            .into_iter()
            .filter(|entry| entry.seq <= state.last_seq)
            .collect::<Vec<_>>();
        let skip = tail.len().saturating_sub(self.services.config.status_tail);
        Ok(SessionSnapshot {
            state,
            tail: tail.into_iter().skip(skip).collect(),
        })
    }

    /// 取消会话；已结束的会话上为空操作
    pub fn cancel(&self, session_id: &str) -> Result<(), OrchestratorError> {
        match self.live_slot(session_id)? {
            Some((supervisor, _)) => {
                if !supervisor.is_cancelled() {
                    tracing::info!(session = %session_id, "cancel requested");
                }
                supervisor.cancel();
                Ok(())
            }
            None if self.known(session_id)? => Ok(()),
            None => Err(OrchestratorError::UnknownSession(session_id.to_string())),
        }
    }

    pub fn answer(&self, request_id: &str, payload: Value) -> Result<(), OrchestratorError> {
        self.services.gate.answer(request_id, payload)
    }

    pub fn pending_requests(
        &self,
        session_id: &str,
    ) -> Result<Vec<HumanRequestView>, OrchestratorError> {
        if self.live_slot(session_id)?.is_none() && !self.known(session_id)? {
            return Err(OrchestratorError::UnknownSession(session_id.to_string()));
        }
        Ok(self.services.gate.pending(session_id))
    }

    /// 执行记录中出现过的会话
    pub fn sessions(&self) -> Result<Vec<SessionId>, OrchestratorError> {
        Ok(self.services.recorder.sessions()?)
    }

    pub fn recorder(&self) -> &Arc<ExecutionRecorder> {
        &self.services.recorder
    }

    pub fn sandbox(&self) -> &Arc<ToolSandbox> {
        &self.services.sandbox
    }
}

/// Dispatcher 构建器
pub struct DispatcherBuilder {
    registry: Arc<ToolRegistry>,
    strategy: Arc<dyn PlanningStrategy>,
    fallbacks: Vec<Arc<dyn PlanningStrategy>>,
    config: OrchestratorConfig,
    sandbox: SandboxSection,
    recorder: Option<Arc<ExecutionRecorder>>,
    context: Option<Arc<dyn ContextProvider>>,
}

impl DispatcherBuilder {
    pub fn new(registry: Arc<ToolRegistry>, strategy: Arc<dyn PlanningStrategy>) -> Self {
        Self {
            registry,
            strategy,
            fallbacks: Vec::new(),
            config: OrchestratorConfig::default(),
            sandbox: SandboxSection::default(),
            recorder: None,
            context: None,
        }
    }

    /// 采用应用配置：编排参数、沙箱参数与记录后端
    pub fn with_app_config(mut self, app: &AppConfig) -> Result<Self, RecorderError> {
        self.config = OrchestratorConfig::from(app);
        self.sandbox = app.sandbox.clone();
        self.recorder = Some(Arc::new(ExecutionRecorder::from_config(&app.recorder)?));
        Ok(self)
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxSection) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// 评审驳回后轮换的后备策略
    pub fn with_fallback(mut self, strategy: Arc<dyn PlanningStrategy>) -> Self {
        self.fallbacks.push(strategy);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<ExecutionRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    pub fn build(self) -> TaskDispatcher {
        let planner = self.fallbacks.into_iter().fold(
            PlanRefinementEngine::new(self.strategy, self.registry.clone(), &self.config),
            |planner, strategy| planner.with_fallback(strategy),
        );

        let sandbox = ToolSandbox::from_config(self.registry, &self.sandbox);
        TaskDispatcher {
            services: SharedServices {
                recorder: self
                    .recorder
                    .unwrap_or_else(|| Arc::new(ExecutionRecorder::in_memory())),
                sandbox: Arc::new(sandbox),
                planner: Arc::new(planner),
                gate: Arc::new(HumanInterventionGate::new()),
                config: self.config,
            },
            context: self.context.unwrap_or_else(|| Arc::new(NoContext)),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}
