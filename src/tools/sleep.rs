//! Sleep 工具：等待指定毫秒后返回，用于演练超时与并发

use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::{schema_value, Tool, ToolError};

#[derive(Debug, Deserialize, JsonSchema)]
struct SleepArgs {
    /// 等待毫秒数
    millis: u64,
}

pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Wait for the given number of milliseconds. Args: {\"millis\": 100}"
    }

    fn parameters_schema(&self) -> Value {
        schema_value::<SleepArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let args: SleepArgs =
            serde_json::from_value(args).map_err(|e| ToolError::invalid_parameters(e.to_string()))?;
        tokio::time::sleep(Duration::from_millis(args.millis)).await;
        Ok(serde_json::json!({ "slept_ms": args.millis }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_reports_duration() {
        let out = SleepTool.execute(json!({"millis": 250})).await.unwrap();
        assert_eq!(out["slept_ms"], 250);
    }
}
