//! 计划类型定义
//!
//! 任务（不可变输入）、内容寻址的步骤 ID、步骤规格 / 步骤状态、计划与计划错误

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::tools::ToolErrorKind;

pub type SessionId = String;

/// 步骤 ID 的 v5 命名空间
const STEP_NAMESPACE: Uuid = Uuid::from_u128(0x6869_7665_2d73_7465_702d_6964_2d76_3500);

/// 用户提交的任务：提交后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// 自然语言目标
    pub goal: String,
    /// 能力白名单：本任务允许使用的工具名
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
    /// 截止时间（可选）
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new<I, S>(goal: impl Into<String>, allowed_tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            goal: goal.into(),
            allowed_tools: allowed_tools.into_iter().map(Into::into).collect(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.allowed_tools.contains(tool)
    }
}

/// 步骤 ID：由子目标、工具名与参数的规范 JSON 派生（UUID v5），逻辑不变的步骤在重规划后保持同一 ID
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 内容寻址：serde_json 的对象按键排序，同一内容总是得到同一 ID
    pub fn derive(goal: &str, tool: &str, params: &Value) -> Self {
        let canonical = serde_json::json!({
            "goal": goal,
            "tool": tool,
            "params": params,
        });
        let uuid = Uuid::new_v5(&STEP_NAMESPACE, canonical.to_string().as_bytes());
        Self(format!("step_{}", uuid.simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 单个参数的绑定：字面量，或引用某个依赖步骤的输出（可取其顶层字段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamBinding {
    Literal {
        value: Value,
    },
    StepOutput {
        step: StepId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

/// 工具调用描述：工具名 + 参数绑定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBinding {
    pub tool: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamBinding>,
}

impl ToolBinding {
    /// 引用了其他步骤输出的参数名
    pub fn deferred_params(&self) -> BTreeSet<String> {
        self.params
            .iter()
            .filter(|(_, b)| matches!(b, ParamBinding::StepOutput { .. }))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// 字面量参数
    pub fn literal_params(&self) -> serde_json::Map<String, Value> {
        self.params
            .iter()
            .filter_map(|(k, b)| match b {
                ParamBinding::Literal { value } => Some((k.clone(), value.clone())),
                ParamBinding::StepOutput { .. } => None,
            })
            .collect()
    }
}

/// 步骤输出的后置条件；不满足时由执行器请求重规划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Postcondition {
    /// 输出非空（非 null、非空字符串 / 数组 / 对象）
    NonEmpty,
    /// 输出文本包含指定内容
    ResultContains(String),
    /// 输出为对象且含指定字段
    HasField(String),
}

impl Postcondition {
    pub fn holds(&self, output: &Value) -> bool {
        match self {
            Postcondition::NonEmpty => match output {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                _ => true,
            },
            Postcondition::ResultContains(text) => match output {
                Value::String(s) => s.contains(text.as_str()),
                other => other.to_string().contains(text.as_str()),
            },
            Postcondition::HasField(name) => output
                .as_object()
                .map(|o| o.contains_key(name))
                .unwrap_or(false),
        }
    }
}

/// 步骤的不可变规格；各修订版之间通过 Arc 共享
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    /// 规划器给出的短名，重规划时用于引用已有步骤
    pub label: String,
    /// 子目标
    pub goal: String,
    pub binding: ToolBinding,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcondition: Option<Postcondition>,
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// 等待依赖完成
    Pending,
    /// 依赖全部成功，可派发
    Ready,
    /// 正在执行（含等待人工回复）
    Running,
    Succeeded,
    Failed,
    /// 被重规划废弃，或因祖先失败 / 会话终止而不再执行
    Skipped,
}

impl StepState {
    pub fn is_settled(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Failed | StepState::Skipped)
    }
}

/// 步骤失败详情
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// 计划中的步骤：共享规格 + 生命周期状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub spec: Arc<StepSpec>,
    pub state: StepState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
}

impl PlanStep {
    pub fn new(spec: Arc<StepSpec>) -> Self {
        Self {
            spec,
            state: StepState::Pending,
            attempts: 0,
            output: None,
            error: None,
        }
    }

    pub fn id(&self) -> &StepId {
        &self.spec.id
    }
}

/// 计划：步骤 DAG + 修订号。重规划总是生成新的修订版
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub revision: u32,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(revision: u32, steps: Vec<PlanStep>) -> Self {
        Self { revision, steps }
    }

    pub fn step(&self, id: &StepId) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id() == id)
    }

    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id() == id)
    }

    pub fn step_by_label(&self, label: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.spec.label == label)
    }

    pub fn ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id().clone()).collect()
    }

    pub fn count_in(&self, state: StepState) -> usize {
        self.steps.iter().filter(|s| s.state == state).count()
    }

    /// 所有步骤都已落定（成功 / 失败 / 跳过）
    pub fn is_settled(&self) -> bool {
        self.steps.iter().all(|s| s.state.is_settled())
    }

    /// 结构校验：ID 唯一、依赖存在、输出绑定只引用依赖、无环
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.id().clone()) {
                return Err(PlanError::DuplicateStep(step.id().to_string()));
            }
        }
        for step in &self.steps {
            for dep in &step.spec.depends_on {
                if !seen.contains(dep) {
                    return Err(PlanError::MissingDependency {
                        step: step.spec.label.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }
            for binding in step.spec.binding.params.values() {
                if let ParamBinding::StepOutput { step: target, .. } = binding {
                    if !step.spec.depends_on.contains(target) {
                        return Err(PlanError::UnboundReference {
                            step: step.spec.label.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }
        crate::plan::PlanGraph::new(self).topological_order()?;
        Ok(())
    }
}

/// 计划错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Plan has no steps")]
    Empty,
    #[error("Duplicate step: {0}")]
    DuplicateStep(String),
    #[error("Step {step} depends on missing step {dependency}")]
    MissingDependency { step: String, dependency: String },
    #[error("Cyclic dependency detected at {0}")]
    CyclicDependency(String),
    #[error("Unknown tool '{tool}' in step {step}")]
    UnknownTool { step: String, tool: String },
    #[error("Tool '{tool}' is not allowed for this task (step {step})")]
    ToolNotAllowed { step: String, tool: String },
    #[error("Invalid parameters for step {step}: {reason}")]
    InvalidParameters { step: String, reason: String },
    #[error("Step {step} binds the output of {target}, which is not one of its dependencies")]
    UnboundReference { step: String, target: String },
    #[error("Step {step} depends on retired step {dependency}")]
    RetiredDependency { step: String, dependency: String },
    #[error("Label {0} belongs to a succeeded step with different content; choose another label")]
    FrozenLabel(String),
}
