//! 会话上下文提供者
//!
//! 规划前由 Dispatcher 拉取会话的历史交互；编排器只读取，不写回。

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::llm::Message;

/// 一次历史交互（用户 / 助手消息）
pub type Exchange = Message;

#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn load_context(&self, session_id: &str) -> Vec<Exchange>;
}

/// 无上下文
#[derive(Debug, Default)]
pub struct NoContext;

#[async_trait]
impl ContextProvider for NoContext {
    async fn load_context(&self, _session_id: &str) -> Vec<Exchange> {
        Vec::new()
    }
}

/// 内存中的固定上下文：按会话预置，未预置的会话使用共享的默认历史
#[derive(Debug, Default)]
pub struct StaticContext {
    shared: Vec<Exchange>,
    per_session: RwLock<HashMap<String, Vec<Exchange>>>,
}

impl StaticContext {
    pub fn new(shared: Vec<Exchange>) -> Self {
        Self {
            shared,
            per_session: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, session_id: impl Into<String>, exchanges: Vec<Exchange>) {
        if let Ok(mut map) = self.per_session.write() {
            map.insert(session_id.into(), exchanges);
        }
    }
}

#[async_trait]
impl ContextProvider for StaticContext {
    async fn load_context(&self, session_id: &str) -> Vec<Exchange> {
        self.per_session
            .read()
            .ok()
            .and_then(|map| map.get(session_id).cloned())
            .unwrap_or_else(|| self.shared.clone())
    }
}
