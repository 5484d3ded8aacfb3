//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 规划阶段用注册表校验工具名与参数，执行阶段由 ToolSandbox 取出工具调用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::ToolError;

/// 工具 trait：名称、描述（供规划器理解）、参数 JSON Schema、异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划步骤中的 tool 字段）
    fn name(&self) -> &str;

    /// 工具描述
    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认不限参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<Value, ToolError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 已注册工具名（排序）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.tool_names()
            .into_iter()
            .filter_map(|name| {
                let tool = self.tools.get(&name)?;
                Some((name, tool.description().to_string()))
            })
            .collect()
    }

    /// 单个工具的描述信息：名称、描述、参数 schema
    pub fn schema(&self, name: &str) -> Option<Value> {
        self.tools.get(name).map(|tool| {
            serde_json::json!({
                "name": name,
                "description": tool.description(),
                "parameters": tool.parameters_schema()
            })
        })
    }

    /// 生成工具目录 JSON（可只包含任务白名单内的工具），供规划提示词使用
    pub fn to_schema_json(&self, only: Option<&dyn Fn(&str) -> bool>) -> String {
        let tools: Vec<Value> = self
            .tool_names()
            .iter()
            .filter(|name| only.map(|f| f(name)).unwrap_or(true))
            .filter_map(|name| self.schema(name))
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}
