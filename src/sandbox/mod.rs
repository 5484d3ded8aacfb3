//! 工具沙箱
//!
//! 单次工具调用的隔离执行：能力白名单 → 输入过滤（参数个数、内存上限、危险模式）→ 参数 schema 校验，
//! 任何一项不通过都不会进入工具。通过后工具在独立的 tokio 任务中以拥有所有权的参数运行，
//! 受硬超时约束；panic 被隔离为 Fatal。沙箱从不重试。每次调用输出一行 JSON 审计日志。
//!
//! 进程内的工具无法单独计量内存与 CPU：内存上限作用于参数与结果的序列化体积之和，
//! CPU 时间以墙钟超时代替。两者都可在运行时调整。

pub mod stats;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::SandboxSection;
use crate::plan::StepId;
use crate::tools::{validate_args, ToolError, ToolRegistry};

pub use stats::{ExecutionSummary, SandboxStats};
use stats::{truncate_chars, StatsBook};

/// 工具调用请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub params: Map<String, Value>,
    pub step_id: StepId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Failure,
}

/// 工具调用响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub status: InvocationStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub duration_ms: u64,
}

impl ToolResponse {
    fn success(result: Value, duration_ms: u64) -> Self {
        Self {
            status: InvocationStatus::Success,
            result,
            error: None,
            duration_ms,
        }
    }

    fn failure(error: ToolError, duration_ms: u64) -> Self {
        Self {
            status: InvocationStatus::Failure,
            result: Value::Null,
            error: Some(error),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == InvocationStatus::Success
    }

    pub fn into_result(self) -> Result<Value, ToolError> {
        match (self.status, self.error) {
            (InvocationStatus::Success, _) => Ok(self.result),
            (InvocationStatus::Failure, Some(e)) => Err(e),
            (InvocationStatus::Failure, None) => Err(ToolError::fatal("tool failed without an error")),
        }
    }
}

/// 工具沙箱
pub struct ToolSandbox {
    registry: Arc<ToolRegistry>,
    timeout_ms: AtomicU64,
    max_memory_bytes: AtomicUsize,
    max_output_bytes: usize,
    max_args: usize,
    deny: Vec<Regex>,
    book: Mutex<StatsBook>,
}

impl ToolSandbox {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self::from_config(registry, &SandboxSection::default())
    }

    /// 按 [sandbox] 配置构造；无法编译的正则被忽略并告警
    pub fn from_config(registry: Arc<ToolRegistry>, config: &SandboxSection) -> Self {
        let deny = config
            .deny_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid sandbox deny pattern ignored");
                    None
                }
            })
            .collect();
        Self {
            registry,
            timeout_ms: AtomicU64::new(config.timeout_secs.saturating_mul(1000)),
            max_memory_bytes: AtomicUsize::new(config.max_memory_bytes),
            max_output_bytes: config.max_output_bytes,
            max_args: config.max_args,
            deny,
            book: Mutex::new(StatsBook::new(config.history_limit)),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.set_max_execution_time(timeout);
        self
    }

    /// 调整单次调用的超时（作为 CPU 时间上限）
    pub fn set_max_execution_time(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_ms.store(ms, Ordering::Relaxed);
        tracing::info!(timeout_ms = ms, "sandbox execution time limit updated");
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// 调整内存上限（参数与结果的序列化字节数之和）
    pub fn set_max_memory_usage(&self, bytes: usize) {
        self.max_memory_bytes.store(bytes, Ordering::Relaxed);
        tracing::info!(bytes, "sandbox memory limit updated");
    }

    pub fn max_memory_usage(&self) -> usize {
        self.max_memory_bytes.load(Ordering::Relaxed)
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 可用工具名
    pub fn list_tools(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    /// 单个工具的名称、描述与参数 schema
    pub fn tool_schema(&self, name: &str) -> Option<Value> {
        self.registry.schema(name)
    }

    /// 执行一次工具调用；capabilities 为会话任务的工具白名单
    pub async fn invoke(&self, request: ToolInvocation, capabilities: &BTreeSet<String>) -> ToolResponse {
        let start = Instant::now();
        let preview = truncate_chars(&Value::Object(request.params.clone()).to_string(), 200);

        let (response, outcome) = match self.admit(&request, capabilities) {
            Err(e) => (ToolResponse::failure(e, elapsed_ms(start)), "rejected"),
            Ok((tool, args_bytes)) => {
                self.run(tool, request.params.clone(), args_bytes, start)
                    .await
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": request.tool,
            "step_id": request.step_id,
            "ok": response.is_success(),
            "outcome": outcome,
            "duration_ms": response.duration_ms,
            "args_preview": preview,
        });
        if response.is_success() {
            tracing::info!(audit = %audit.to_string(), "tool");
        } else {
            tracing::warn!(audit = %audit.to_string(), "tool");
        }

        let result_preview = match &response.error {
            Some(e) => e.to_string(),
            None => response.result.to_string(),
        };
        if let Ok(mut book) = self.book.lock() {
            book.record(ExecutionSummary {
                tool: request.tool.clone(),
                step_id: request.step_id.clone(),
                ok: response.is_success(),
                outcome,
                duration_ms: response.duration_ms,
                result_preview,
                at: chrono::Utc::now(),
            });
        }
        response
    }

    /// 进入工具之前的全部检查；通过时返回工具与参数的序列化字节数
    fn admit(
        &self,
        request: &ToolInvocation,
        capabilities: &BTreeSet<String>,
    ) -> Result<(Arc<dyn crate::tools::Tool>, usize), ToolError> {
        if !capabilities.contains(&request.tool) {
            return Err(ToolError::sandbox_violation(format!(
                "tool '{}' is not in the task capability set",
                request.tool
            )));
        }
        if request.params.len() > self.max_args {
            return Err(ToolError::invalid_parameters(format!(
                "too many arguments: {} > {}",
                request.params.len(),
                self.max_args
            )));
        }
        let flat = Value::Object(request.params.clone()).to_string();
        let memory = self.max_memory_usage();
        if flat.len() > memory {
            return Err(ToolError::sandbox_violation(format!(
                "arguments of {} bytes exceed memory limit {memory}",
                flat.len()
            )));
        }
        if let Some(re) = self.deny.iter().find(|re| re.is_match(&flat)) {
            return Err(ToolError::sandbox_violation(format!(
                "arguments match denied pattern '{}'",
                re.as_str()
            )));
        }
        let tool = self
            .registry
            .get(&request.tool)
            .ok_or_else(|| ToolError::fatal(format!("tool '{}' is not registered", request.tool)))?;
        validate_args(&tool.parameters_schema(), &request.params)
            .map_err(ToolError::invalid_parameters)?;
        Ok((tool, flat.len()))
    }

    async fn run(
        &self,
        tool: Arc<dyn crate::tools::Tool>,
        params: Map<String, Value>,
        args_bytes: usize,
        start: Instant,
    ) -> (ToolResponse, &'static str) {
        let name = tool.name().to_string();
        let timeout = self.max_execution_time();
        let mut handle = tokio::spawn(async move { tool.execute(Value::Object(params)).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => {
                let size = serde_json::to_vec(&result).map(|b| b.len()).unwrap_or(usize::MAX);
                let memory = self.max_memory_usage();
                if size > self.max_output_bytes {
                    let err = ToolError::sandbox_violation(format!(
                        "output of {size} bytes exceeds limit {}",
                        self.max_output_bytes
                    ));
                    (ToolResponse::failure(err, elapsed_ms(start)), "rejected")
                } else if size.saturating_add(args_bytes) > memory {
                    let err = ToolError::sandbox_violation(format!(
                        "arguments and output of {} bytes exceed memory limit {memory}",
                        size.saturating_add(args_bytes)
                    ));
                    (ToolResponse::failure(err, elapsed_ms(start)), "rejected")
                } else {
                    (ToolResponse::success(result, elapsed_ms(start)), "ok")
                }
            }
            Ok(Ok(Err(e))) => (ToolResponse::failure(e, elapsed_ms(start)), "error"),
            Ok(Err(join_err)) => {
                let err = ToolError::fatal(format!("tool '{name}' crashed: {join_err}"));
                (ToolResponse::failure(err, elapsed_ms(start)), "panic")
            }
            Err(_) => {
                handle.abort();
                let err = ToolError::timeout(format!(
                    "tool '{name}' exceeded {}ms",
                    timeout.as_millis()
                ));
                (ToolResponse::failure(err, elapsed_ms(start)), "timeout")
            }
        }
    }

    pub fn stats(&self) -> SandboxStats {
        self.book.lock().map(|b| b.snapshot()).unwrap_or_default()
    }

    /// 最近 n 次执行
    pub fn history(&self, n: usize) -> Vec<ExecutionSummary> {
        self.book.lock().map(|b| b.recent(n)).unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut book) = self.book.lock() {
            book.clear();
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
