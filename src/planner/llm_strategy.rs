//! 基于 LLM 的规划策略
//!
//! 把目标、历史交互、工具目录与草稿格式拼成提示词交给 LlmClient；
//! 从回复中提取 JSON 数组（```json 代码块或裸 JSON）并解析为草稿。

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::PlanningError;
use crate::llm::{LlmClient, Message};
use crate::plan::{Plan, StepDraft};
use crate::planner::strategy::{DraftInput, PlanningStrategy};
use crate::tools::plan_draft_schema_json;

const SYSTEM_PROMPT: &str = "You are the planner of a tool-using agent. \
Break the user's goal into a small DAG of tool calls. \
Reply with a JSON array of steps only. Each step has a unique label, a goal, \
a tool from the catalogue, params matching the tool schema and depends_on labels. \
To pass the output of an earlier step use {\"$from\": \"label\"} (optionally with \"field\").";

/// 从 LLM 回复中解析草稿数组
pub fn parse_drafts(output: &str) -> Result<Vec<StepDraft>, PlanningError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Err(PlanningError::Strategy(format!(
            "no JSON plan in reply: {}",
            truncate(trimmed, 200)
        )));
    };

    serde_json::from_str(json_str)
        .map_err(|e| PlanningError::Strategy(format!("{}: {}", e, truncate(json_str, 200))))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub struct LlmPlanningStrategy {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanningStrategy {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn messages(&self, input: &DraftInput<'_>, request: String) -> Vec<Message> {
        let system = format!(
            "{}\n\n## Tools\n{}\n\n## Step format\n{}",
            self.system_prompt,
            input.tool_catalogue,
            plan_draft_schema_json()
        );
        let mut messages = vec![Message::system(system)];
        messages.extend(input.context.iter().cloned());

        let mut request = request;
        if let Some(critique) = input.critique {
            request.push_str(&format!(
                "\n\nYour previous plan was rejected: {critique}\nFix it and reply with the full JSON array."
            ));
        }
        messages.push(Message::user(request));
        messages
    }

    async fn ask(&self, messages: Vec<Message>) -> Result<Vec<StepDraft>, PlanningError> {
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(PlanningError::Llm)?;
        parse_drafts(&reply)
    }
}

#[async_trait]
impl PlanningStrategy for LlmPlanningStrategy {
    fn name(&self) -> &str {
        "llm"
    }

    async fn draft(&self, input: DraftInput<'_>) -> Result<Vec<StepDraft>, PlanningError> {
        let messages = self.messages(&input, format!("Goal: {}", input.task.goal));
        self.ask(messages).await
    }

    async fn redraft(
        &self,
        input: DraftInput<'_>,
        current: &Plan,
        failure: &str,
    ) -> Result<Vec<StepDraft>, PlanningError> {
        let steps: Vec<serde_json::Value> = current
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "label": s.spec.label,
                    "tool": s.spec.binding.tool,
                    "state": s.state,
                    "output": s.output,
                })
            })
            .collect();
        let request = format!(
            "Goal: {}\n\nCurrent plan (revision {}):\n{}\n\nFailure: {}\n\n\
             Produce a revised plan. Steps that already succeeded can be referenced by label and are not re-run.",
            input.task.goal,
            current.revision,
            serde_json::to_string_pretty(&steps).unwrap_or_default(),
            failure
        );
        let messages = self.messages(&input, request);
        self.ask(messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, Role};
    use crate::plan::Task;

    #[test]
    fn test_parse_fenced_and_raw() {
        let fenced = "Here you go:\n```json\n[{\"label\": \"a\", \"tool\": \"echo\", \"params\": {\"text\": 1}}]\n```";
        let drafts = parse_drafts(fenced).unwrap();
        assert_eq!(drafts[0].label, "a");

        let raw = "[{\"label\": \"a\", \"tool\": \"echo\"}, {\"label\": \"b\", \"tool\": \"echo\", \"depends_on\": [\"a\"]}]";
        assert_eq!(parse_drafts(raw).unwrap().len(), 2);

        assert!(parse_drafts("I cannot help with that").is_err());
    }

    #[tokio::test]
    async fn test_draft_includes_critique_and_context() {
        let llm = Arc::new(
            MockLlmClient::new().with_reply(r#"[{"label": "a", "tool": "echo", "params": {"text": "hi"}}]"#),
        );
        let strategy = LlmPlanningStrategy::new(llm.clone());
        let task = Task::new("say hi", ["echo"]);
        let context = vec![Message::user("earlier question")];
        let input = DraftInput {
            task: &task,
            context: &context,
            tool_catalogue: "[]",
            critique: Some("Unknown tool 'shell'"),
        };

        let drafts = strategy.draft(input).await.unwrap();
        assert_eq!(drafts[0].tool, "echo");

        let prompt = &llm.prompts()[0];
        assert_eq!(prompt[0].role, Role::System);
        assert_eq!(prompt[1].content, "earlier question");
        assert!(prompt.last().unwrap().content.contains("Unknown tool 'shell'"));
    }

    #[tokio::test]
    async fn test_llm_error_is_reported() {
        let llm = Arc::new(MockLlmClient::new().with_error("rate limited"));
        let strategy = LlmPlanningStrategy::new(llm);
        let task = Task::new("say hi", ["echo"]);
        let input = DraftInput {
            task: &task,
            context: &[],
            tool_catalogue: "[]",
            critique: None,
        };
        assert!(matches!(
            strategy.draft(input).await,
            Err(PlanningError::Llm(_))
        ));
    }
}
