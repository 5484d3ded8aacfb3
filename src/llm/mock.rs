//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置回复；回复用完后退回为单步 echo 计划，回显最后一条 User 消息。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<Vec<Message>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一条回复
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Ok(reply.into()));
        }
        self
    }

    /// 预置一次失败
    pub fn with_error(self, error: impl Into<String>) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(Err(error.into()));
        }
        self
    }

    /// 收到过的全部请求
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(messages.to_vec());
        }
        if let Some(reply) = self.replies.lock().ok().and_then(|mut r| r.pop_front()) {
            return reply;
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let plan = serde_json::json!([{
            "label": "echo",
            "tool": "echo",
            "params": {"text": format!("Echo from Mock: {last_user}")},
            "depends_on": []
        }]);
        Ok(plan.to_string())
    }
}
