//! 计划草稿构建器
//!
//! 规划策略输出 StepDraft（以 label 互相引用），由 PlanRefinementEngine 解析为带 StepId 的计划。
//! PlanBuilder 提供流畅的 API 来拼装草稿。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::plan::types::Postcondition;

/// 参数中引用其他步骤输出的标记键：`{"$from": "label", "field": "可选字段"}`
pub const BINDING_KEY: &str = "$from";

/// 单个步骤草稿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub label: String,
    /// 子目标，缺省时用 label
    #[serde(default)]
    pub goal: String,
    pub tool: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub postcondition: Option<Postcondition>,
}

impl StepDraft {
    pub fn new(label: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            goal: String::new(),
            tool: tool.into(),
            params: Map::new(),
            depends_on: Vec::new(),
            postcondition: None,
        }
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    /// 字面量参数
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// 将参数绑定到某个依赖步骤的完整输出（同时声明依赖）
    pub fn bind(self, key: impl Into<String>, from: impl Into<String>) -> Self {
        self.bind_field(key, from, None::<String>)
    }

    /// 将参数绑定到某个依赖步骤输出的顶层字段
    pub fn bind_field(
        mut self,
        key: impl Into<String>,
        from: impl Into<String>,
        field: Option<impl Into<String>>,
    ) -> Self {
        let from = from.into();
        let mut binding = Map::new();
        binding.insert(BINDING_KEY.to_string(), Value::String(from.clone()));
        if let Some(field) = field {
            binding.insert("field".to_string(), Value::String(field.into()));
        }
        self.params.insert(key.into(), Value::Object(binding));
        if !self.depends_on.contains(&from) {
            self.depends_on.push(from);
        }
        self
    }

    pub fn after(mut self, label: impl Into<String>) -> Self {
        let label = label.into();
        if !self.depends_on.contains(&label) {
            self.depends_on.push(label);
        }
        self
    }

    pub fn expect(mut self, postcondition: Postcondition) -> Self {
        self.postcondition = Some(postcondition);
        self
    }

    /// 子目标（空时回退为 label）
    pub fn effective_goal(&self) -> &str {
        if self.goal.trim().is_empty() {
            &self.label
        } else {
            &self.goal
        }
    }
}

/// 草稿列表构建器
#[derive(Debug, Default)]
pub struct PlanBuilder {
    drafts: Vec<StepDraft>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加步骤
    pub fn step(mut self, draft: StepDraft) -> Self {
        self.drafts.push(draft);
        self
    }

    /// 设置顺序依赖
    pub fn sequential(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        self.depends_on_all(to, vec![from])
    }

    /// 设置 AND 依赖（所有前置步骤）
    pub fn depends_on_all(mut self, label: impl Into<String>, deps: Vec<String>) -> Self {
        let label = label.into();
        if let Some(draft) = self.drafts.iter_mut().find(|d| d.label == label) {
            for dep in deps {
                if !draft.depends_on.contains(&dep) {
                    draft.depends_on.push(dep);
                }
            }
        }
        self
    }

    pub fn build(self) -> Vec<StepDraft> {
        self.drafts
    }
}
