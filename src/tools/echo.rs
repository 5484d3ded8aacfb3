//! Echo 工具（测试用）

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema_value, Tool, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoArgs {
    /// 要回显的内容
    text: Value,
}

/// Echo 工具：原样返回 text 参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo a value back (for testing). Args: {\"text\": any}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<EchoArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: EchoArgs =
            serde_json::from_value(args).map_err(|e| ToolError::invalid_parameters(e.to_string()))?;
        Ok(args.text)
    }
}
