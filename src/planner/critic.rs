//! PlanCritic：草稿的结构评审
//!
//! 在草稿解析为计划之前逐步检查：计划非空、工具已注册、工具在任务白名单内、字面量参数符合工具 schema。
//! 重复步骤、悬空依赖与环在解析阶段报告。驳回原因会作为 critique 交还给策略。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::plan::{PlanError, StepDraft, Task, BINDING_KEY};
use crate::tools::{validate_args, ToolRegistry};

/// 草稿参数是否为输出引用
pub fn is_reference(value: &Value) -> Option<&str> {
    value
        .as_object()
        .and_then(|o| o.get(BINDING_KEY))
        .and_then(|v| v.as_str())
}

pub struct PlanCritic {
    registry: Arc<ToolRegistry>,
}

impl PlanCritic {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn review(&self, task: &Task, drafts: &[StepDraft]) -> Result<(), PlanError> {
        if drafts.is_empty() {
            return Err(PlanError::Empty);
        }
        for draft in drafts {
            let tool = self.registry.get(&draft.tool).ok_or_else(|| PlanError::UnknownTool {
                step: draft.label.clone(),
                tool: draft.tool.clone(),
            })?;
            if !task.allows(&draft.tool) {
                return Err(PlanError::ToolNotAllowed {
                    step: draft.label.clone(),
                    tool: draft.tool.clone(),
                });
            }

            let mut literal = Map::new();
            let mut deferred = BTreeSet::new();
            for (key, value) in &draft.params {
                if is_reference(value).is_some() {
                    deferred.insert(key.clone());
                } else {
                    literal.insert(key.clone(), value.clone());
                }
            }
            relax_deferred(&tool.parameters_schema(), &deferred)
                .and_then(|schema| validate_args(&schema, &literal))
                .map_err(|reason| PlanError::InvalidParameters {
                    step: draft.label.clone(),
                    reason,
                })?;
        }
        Ok(())
    }
}

/// 引用参数运行时才有值：从 required 中移除，类型留给沙箱入口检查；封闭 schema 仍须声明该参数
fn relax_deferred(schema: &Value, deferred: &BTreeSet<String>) -> Result<Value, String> {
    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        let declared = schema.get("properties").and_then(|p| p.as_object());
        if let Some(name) = deferred
            .iter()
            .find(|name| !declared.map(|p| p.contains_key(*name)).unwrap_or(false))
        {
            return Err(format!("unexpected parameter '{name}'"));
        }
    }
    let mut relaxed = schema.clone();
    if let Some(required) = relaxed.get_mut("required").and_then(|r| r.as_array_mut()) {
        required.retain(|name| name.as_str().map(|n| !deferred.contains(n)).unwrap_or(true));
    }
    Ok(relaxed)
}
