//! PlanRefinementEngine：生成与重规划
//!
//! 策略产出草稿 → PlanCritic 评审 → 解析为计划（label 引用换成 StepId、检查重复 / 悬空依赖 / 环）。
//! 驳回原因作为 critique 交还策略重试，多个策略轮换，最多 max_plan_attempts 次。
//! 重规划时已成功的步骤保持 ID、输出与状态；被丢弃的未完成步骤以 Skipped 保留在新修订中。
//! 引擎本身不持有跨调用的可变状态。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::OrchestratorConfig;
use crate::context::Exchange;
use crate::core::PlanningError;
use crate::plan::{
    ParamBinding, Plan, PlanError, PlanStep, StepDraft, StepId, StepSpec, StepState, Task,
    ToolBinding, BINDING_KEY,
};
use crate::planner::critic::{is_reference, PlanCritic};
use crate::planner::strategy::{DraftInput, PlanningStrategy};
use crate::tools::ToolRegistry;

pub struct PlanRefinementEngine {
    strategies: Vec<Arc<dyn PlanningStrategy>>,
    critic: PlanCritic,
    registry: Arc<ToolRegistry>,
    max_plan_attempts: u32,
    max_refinements: u32,
}

impl PlanRefinementEngine {
    pub fn new(
        strategy: Arc<dyn PlanningStrategy>,
        registry: Arc<ToolRegistry>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            strategies: vec![strategy],
            critic: PlanCritic::new(registry.clone()),
            registry,
            max_plan_attempts: config.max_plan_attempts.max(1),
            max_refinements: config.max_refinements,
        }
    }

    /// 追加一个后备策略：评审驳回后按顺序轮换
    pub fn with_fallback(mut self, strategy: Arc<dyn PlanningStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn max_refinements(&self) -> u32 {
        self.max_refinements
    }

    /// 生成修订 0
    pub async fn generate(&self, task: &Task, context: &[Exchange]) -> Result<Plan, PlanningError> {
        self.plan_with_critique(task, context, None).await
    }

    /// 生成下一个修订；修订号即已发生的重规划次数
    pub async fn refine(
        &self,
        task: &Task,
        context: &[Exchange],
        current: &Plan,
        failure: &str,
    ) -> Result<Plan, PlanningError> {
        if current.revision >= self.max_refinements {
            return Err(PlanningError::RefinementsExhausted(self.max_refinements));
        }
        self.plan_with_critique(task, context, Some((current, failure)))
            .await
    }

    async fn plan_with_critique(
        &self,
        task: &Task,
        context: &[Exchange],
        previous: Option<(&Plan, &str)>,
    ) -> Result<Plan, PlanningError> {
        let catalogue = {
            let allowed: &dyn Fn(&str) -> bool = &|name| task.allows(name);
            self.registry.to_schema_json(Some(allowed))
        };
        let mut critique: Option<String> = None;

        for attempt in 0..self.max_plan_attempts {
            let strategy = &self.strategies[attempt as usize % self.strategies.len()];
            let input = DraftInput {
                task,
                context,
                tool_catalogue: &catalogue,
                critique: critique.as_deref(),
            };
            let drafts = match previous {
                None => strategy.draft(input).await,
                Some((plan, failure)) => strategy.redraft(input, plan, failure).await,
            };

            let result = drafts.and_then(|drafts| {
                self.critic.review(task, &drafts)?;
                Ok(resolve_drafts(&drafts, previous.map(|(plan, _)| plan))?)
            });
            match result {
                Ok(plan) => {
                    tracing::info!(
                        strategy = strategy.name(),
                        revision = plan.revision,
                        steps = plan.steps.len(),
                        "plan accepted"
                    );
                    return Ok(plan);
                }
                Err(e) => {
                    tracing::warn!(strategy = strategy.name(), attempt, error = %e, "plan rejected");
                    critique = Some(e.to_string());
                }
            }
        }

        Err(PlanningError::AttemptsExhausted {
            attempts: self.max_plan_attempts,
            last: critique.unwrap_or_default(),
        })
    }
}

/// 草稿引用的 label：depends_on 加上参数中的输出引用
fn referenced_labels(draft: &StepDraft) -> Vec<String> {
    let mut labels = draft.depends_on.clone();
    for value in draft.params.values() {
        if let Some(label) = is_reference(value) {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
    }
    labels
}

/// 将草稿解析为新的计划修订
pub fn resolve_drafts(drafts: &[StepDraft], previous: Option<&Plan>) -> Result<Plan, PlanError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, draft) in drafts.iter().enumerate() {
        if index.insert(draft.label.as_str(), i).is_some() {
            return Err(PlanError::DuplicateStep(draft.label.clone()));
        }
    }

    // 草稿之外的 label 只能指向上一修订中已成功的步骤
    let frozen_by_label = |label: &str| -> Option<StepId> {
        previous?
            .steps
            .iter()
            .rev()
            .find(|s| s.spec.label == label && s.state == StepState::Succeeded)
            .map(|s| s.id().clone())
    };

    let refs: Vec<Vec<String>> = drafts.iter().map(referenced_labels).collect();
    let mut resolved: HashMap<String, StepId> = HashMap::new();
    for (draft, labels) in drafts.iter().zip(&refs) {
        for label in labels {
            if *label == draft.label {
                return Err(PlanError::CyclicDependency(label.clone()));
            }
            if index.contains_key(label.as_str()) {
                continue;
            }
            if let Some(id) = frozen_by_label(label) {
                resolved.insert(label.clone(), id);
                continue;
            }
            let known = previous
                .map(|p| p.step_by_label(label).is_some())
                .unwrap_or(false);
            return Err(if known {
                PlanError::RetiredDependency {
                    step: draft.label.clone(),
                    dependency: label.clone(),
                }
            } else {
                PlanError::MissingDependency {
                    step: draft.label.clone(),
                    dependency: label.clone(),
                }
            });
        }
    }

    // 按 label 的拓扑序派生 ID，引用已替换为依赖的 StepId
    let order = draft_order(drafts, &index, &refs)?;
    let mut specs: Vec<Option<StepSpec>> = vec![None; drafts.len()];
    let mut seen_ids = BTreeSet::new();
    for i in order {
        let draft = &drafts[i];
        let lookup = |label: &str| -> Result<StepId, PlanError> {
            resolved
                .get(label)
                .cloned()
                .ok_or_else(|| PlanError::MissingDependency {
                    step: draft.label.clone(),
                    dependency: label.to_string(),
                })
        };

        let mut canonical = Map::new();
        let mut params = std::collections::BTreeMap::new();
        for (key, value) in &draft.params {
            match is_reference(value) {
                Some(label) => {
                    let step = lookup(label)?;
                    let field = value
                        .get("field")
                        .and_then(|f| f.as_str())
                        .map(str::to_string);
                    let mut reference = Map::new();
                    reference.insert(BINDING_KEY.to_string(), Value::String(step.to_string()));
                    if let Some(field) = &field {
                        reference.insert("field".to_string(), Value::String(field.clone()));
                    }
                    canonical.insert(key.clone(), Value::Object(reference));
                    params.insert(key.clone(), ParamBinding::StepOutput { step, field });
                }
                None => {
                    canonical.insert(key.clone(), value.clone());
                    params.insert(
                        key.clone(),
                        ParamBinding::Literal {
                            value: value.clone(),
                        },
                    );
                }
            }
        }

        let mut depends_on = Vec::new();
        for label in &refs[i] {
            let id = lookup(label)?;
            if !depends_on.contains(&id) {
                depends_on.push(id);
            }
        }

        let id = StepId::derive(draft.effective_goal(), &draft.tool, &Value::Object(canonical));
        if !seen_ids.insert(id.clone()) {
            return Err(PlanError::DuplicateStep(draft.label.clone()));
        }
        // 已成功步骤会被原样带入新修订，其 label 不能再指向别的内容
        let label_taken = previous
            .map(|p| {
                p.steps.iter().any(|s| {
                    s.state == StepState::Succeeded && s.spec.label == draft.label && *s.id() != id
                })
            })
            .unwrap_or(false);
        if label_taken {
            return Err(PlanError::FrozenLabel(draft.label.clone()));
        }
        resolved.insert(draft.label.clone(), id.clone());
        specs[i] = Some(StepSpec {
            id,
            label: draft.label.clone(),
            goal: draft.effective_goal().to_string(),
            binding: ToolBinding {
                tool: draft.tool.clone(),
                params,
            },
            depends_on,
            postcondition: draft.postcondition.clone(),
        });
    }

    let mut steps = Vec::with_capacity(drafts.len());
    if let Some(previous) = previous {
        for step in &previous.steps {
            if seen_ids.contains(step.id()) {
                continue;
            }
            let mut carried = step.clone();
            if carried.state != StepState::Succeeded {
                carried.state = StepState::Skipped;
            }
            steps.push(carried);
        }
    }
    for spec in specs.into_iter().flatten() {
        let step = match previous.and_then(|p| p.step(&spec.id)) {
            Some(prev) if prev.state == StepState::Succeeded => prev.clone(),
            Some(prev) if *prev.spec == spec => PlanStep::new(prev.spec.clone()),
            _ => PlanStep::new(Arc::new(spec)),
        };
        steps.push(step);
    }

    let revision = previous.map(|p| p.revision + 1).unwrap_or(0);
    let plan = Plan::new(revision, steps);
    plan.validate()?;
    Ok(plan)
}

/// 草稿的 Kahn 拓扑序（同层保持草稿顺序）
fn draft_order(
    drafts: &[StepDraft],
    index: &HashMap<&str, usize>,
    refs: &[Vec<String>],
) -> Result<Vec<usize>, PlanError> {
    let mut in_degree = vec![0usize; drafts.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); drafts.len()];
    for (i, labels) in refs.iter().enumerate() {
        for label in labels {
            if let Some(&j) = index.get(label.as_str()) {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..drafts.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(drafts.len());
    while let Some(i) = queue.pop_front() {
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
        order.push(i);
    }

    if order.len() < drafts.len() {
        let stuck = (0..drafts.len())
            .find(|i| in_degree[*i] > 0)
            .map(|i| drafts[i].label.clone())
            .unwrap_or_default();
        return Err(PlanError::CyclicDependency(stuck));
    }
    Ok(order)
}
