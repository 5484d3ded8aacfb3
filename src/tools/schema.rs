//! 参数 JSON Schema：生成（schemars）与校验（jsonschema）
//!
//! 工具用 schemars 从参数结构体派生 schema；沙箱入口用 validate_args 按完整 schema 校验参数，
//! 规划阶段的评审在此之上放宽尚未产生的引用参数。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

/// 计划草稿格式（仅用于 Schema 生成，拼入规划提示词）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct StepDraftFormat {
    /// 步骤短名，供其他步骤在 depends_on 或 {"$from": label} 中引用
    pub label: String,
    /// 子目标描述
    pub goal: String,
    /// 工具名，必须在可用工具列表中
    pub tool: String,
    /// 工具参数；引用前置步骤输出时写 {"$from": "label", "field": "可选字段"}
    pub params: HashMap<String, serde_json::Value>,
    /// 前置步骤 label 列表
    pub depends_on: Vec<String>,
}

/// 返回计划草稿数组的 JSON Schema 字符串，可拼入 system prompt
pub fn plan_draft_schema_json() -> String {
    let schema = schema_for!(Vec<StepDraftFormat>);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

/// 由参数类型派生工具的 parameters_schema
pub fn schema_value<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

/// 按 schema 校验参数对象；所有违规拼成一条说明
pub fn validate_args(schema: &Value, args: &Map<String, Value>) -> Result<(), String> {
    let validator =
        jsonschema::validator_for(schema).map_err(|e| format!("invalid parameter schema: {e}"))?;
    let instance = Value::Object(args.clone());
    let errors: Vec<String> = validator
        .iter_errors(&instance)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{path}: {e}")
            }
        })
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct SearchArgs {
        query: String,
        limit: Option<u32>,
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_schema_generated_from_struct() {
        let schema = schema_value::<SearchArgs>();
        assert_eq!(schema["type"], "object");
        assert!(schema["required"]
            .as_array()
            .unwrap()
            .contains(&json!("query")));
    }

    #[test]
    fn test_validate_accepts_well_typed_args() {
        let schema = schema_value::<SearchArgs>();
        assert!(validate_args(&schema, &args(json!({"query": "weather"}))).is_ok());
        assert!(validate_args(&schema, &args(json!({"query": "w", "limit": 3}))).is_ok());
        assert!(validate_args(&schema, &args(json!({"query": "w", "limit": null}))).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_and_mistyped() {
        let schema = schema_value::<SearchArgs>();
        let missing = validate_args(&schema, &args(json!({}))).unwrap_err();
        assert!(missing.contains("query"));
        let mistyped = validate_args(&schema, &args(json!({"query": 42}))).unwrap_err();
        assert!(mistyped.contains("/query"));
    }

    #[test]
    fn test_validate_enforces_bounds_and_enums() {
        // u32 派生出 minimum: 0
        let schema = schema_value::<SearchArgs>();
        let negative = validate_args(&schema, &args(json!({"query": "w", "limit": -5}))).unwrap_err();
        assert!(negative.contains("/limit"));

        let schema = json!({
            "type": "object",
            "properties": {"unit": {"enum": ["metric", "imperial"]}},
        });
        assert!(validate_args(&schema, &args(json!({"unit": "metric"}))).is_ok());
        assert!(validate_args(&schema, &args(json!({"unit": "kelvin"}))).is_err());
    }

    #[test]
    fn test_validate_follows_nested_definitions() {
        #[allow(dead_code)]
        #[derive(Deserialize, JsonSchema)]
        struct Window {
            from: u32,
            to: u32,
        }

        #[allow(dead_code)]
        #[derive(Deserialize, JsonSchema)]
        struct ReportArgs {
            window: Window,
        }

        let schema = schema_value::<ReportArgs>();
        assert!(validate_args(&schema, &args(json!({"window": {"from": 1, "to": 2}}))).is_ok());
        assert!(validate_args(&schema, &args(json!({"window": {"from": 1}}))).is_err());
    }

    #[test]
    fn test_closed_schema_rejects_unknown() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}, "additionalProperties": false});
        assert!(validate_args(&schema, &args(json!({"b": 1}))).is_err());
    }

    #[test]
    fn test_plan_draft_schema_mentions_fields() {
        let schema = plan_draft_schema_json();
        assert!(schema.contains("depends_on"));
        assert!(schema.contains("label"));
    }
}
