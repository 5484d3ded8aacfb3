//! 规划策略
//!
//! 策略只产出草稿（StepDraft 列表），不接触 StepId 与步骤状态；解析、评审与冻结结果的保留都由
//! PlanRefinementEngine 完成。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::Exchange;
use crate::core::PlanningError;
use crate::plan::{ParamBinding, Plan, StepDraft, StepId, StepState, Task, BINDING_KEY};

/// 交给策略的输入
#[derive(Debug, Clone, Copy)]
pub struct DraftInput<'a> {
    pub task: &'a Task,
    pub context: &'a [Exchange],
    /// 任务白名单内工具的目录 JSON
    pub tool_catalogue: &'a str,
    /// 上一份草稿被评审驳回的原因
    pub critique: Option<&'a str>,
}

#[async_trait]
pub trait PlanningStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// 初始计划草稿
    async fn draft(&self, input: DraftInput<'_>) -> Result<Vec<StepDraft>, PlanningError>;

    /// 基于当前计划与失败上下文的新草稿
    async fn redraft(
        &self,
        input: DraftInput<'_>,
        current: &Plan,
        failure: &str,
    ) -> Result<Vec<StepDraft>, PlanningError>;
}

/// 把计划中未被跳过的步骤还原为草稿（输出绑定还原为 label 引用）
pub fn drafts_from_plan(plan: &Plan) -> Vec<StepDraft> {
    let label_of = |id: &StepId| -> String {
        plan.step(id)
            .map(|s| s.spec.label.clone())
            .unwrap_or_else(|| id.to_string())
    };

    plan.steps
        .iter()
        .filter(|step| step.state != StepState::Skipped)
        .map(|step| {
            let spec = &step.spec;
            let params: Map<String, Value> = spec
                .binding
                .params
                .iter()
                .map(|(key, binding)| {
                    let value = match binding {
                        ParamBinding::Literal { value } => value.clone(),
                        ParamBinding::StepOutput { step, field } => {
                            let mut reference = Map::new();
                            reference.insert(BINDING_KEY.to_string(), Value::String(label_of(step)));
                            if let Some(field) = field {
                                reference.insert("field".to_string(), Value::String(field.clone()));
                            }
                            Value::Object(reference)
                        }
                    };
                    (key.clone(), value)
                })
                .collect();
            StepDraft {
                label: spec.label.clone(),
                goal: spec.goal.clone(),
                tool: spec.binding.tool.clone(),
                params,
                depends_on: spec.depends_on.iter().map(|id| label_of(id)).collect(),
                postcondition: spec.postcondition.clone(),
            }
        })
        .collect()
}

/// 确定性策略：draft 返回预置草稿，redraft 依次取出预置的修订草稿；
/// 修订草稿用完后重新提交当前计划（未完成步骤从头执行）
pub struct FixedPlanStrategy {
    initial: Vec<StepDraft>,
    redrafts: Mutex<VecDeque<Vec<StepDraft>>>,
}

impl FixedPlanStrategy {
    pub fn new(initial: Vec<StepDraft>) -> Self {
        Self {
            initial,
            redrafts: Mutex::new(VecDeque::new()),
        }
    }

    /// 追加一份修订草稿
    pub fn then(self, redraft: Vec<StepDraft>) -> Self {
        if let Ok(mut queue) = self.redrafts.lock() {
            queue.push_back(redraft);
        }
        self
    }
}

#[async_trait]
impl PlanningStrategy for FixedPlanStrategy {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn draft(&self, _input: DraftInput<'_>) -> Result<Vec<StepDraft>, PlanningError> {
        Ok(self.initial.clone())
    }

    async fn redraft(
        &self,
        _input: DraftInput<'_>,
        current: &Plan,
        _failure: &str,
    ) -> Result<Vec<StepDraft>, PlanningError> {
        let next = self
            .redrafts
            .lock()
            .map_err(|_| PlanningError::Strategy("redraft queue poisoned".to_string()))?
            .pop_front();
        Ok(next.unwrap_or_else(|| drafts_from_plan(current)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{PlanStep, StepSpec, ToolBinding};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn test_drafts_from_plan_restores_label_references() {
        let fetch = StepId::new("step_fetch");
        let mut params = BTreeMap::new();
        params.insert(
            "text".to_string(),
            ParamBinding::StepOutput {
                step: fetch.clone(),
                field: Some("body".into()),
            },
        );
        let plan = Plan::new(
            0,
            vec![
                PlanStep::new(Arc::new(StepSpec {
                    id: fetch.clone(),
                    label: "fetch".into(),
                    goal: "fetch".into(),
                    binding: ToolBinding {
                        tool: "search".into(),
                        params: BTreeMap::new(),
                    },
                    depends_on: vec![],
                    postcondition: None,
                })),
                PlanStep::new(Arc::new(StepSpec {
                    id: StepId::new("step_sum"),
                    label: "sum".into(),
                    goal: "summarize".into(),
                    binding: ToolBinding {
                        tool: "summarize".into(),
                        params,
                    },
                    depends_on: vec![fetch],
                    postcondition: None,
                })),
            ],
        );

        let drafts = drafts_from_plan(&plan);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[1].depends_on, vec!["fetch".to_string()]);
        assert_eq!(drafts[1].params["text"][BINDING_KEY], "fetch");
        assert_eq!(drafts[1].params["text"]["field"], "body");
    }
}
