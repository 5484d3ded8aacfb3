//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ORCHESTRATOR__MAX_PARALLELISM=8`）。
//! 编排器本身只接收不可变的 OrchestratorConfig（由 AppConfig 转换而来）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub recorder: RecorderSection,
}

/// [orchestrator] 段：并发、重试、重规划与人工介入
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    /// 单个会话内同时执行的步骤上限
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Retryable 失败的重试次数（不含首次执行）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 每个会话的重规划次数上限
    #[serde(default = "default_max_refinements")]
    pub max_refinements: u32,
    /// 单次生成 / 重规划内，草稿被评审驳回后的最多尝试次数
    #[serde(default = "default_max_plan_attempts")]
    pub max_plan_attempts: u32,
    /// 人工请求默认截止（秒）
    #[serde(default = "default_human_deadline_secs")]
    pub human_deadline_secs: u64,
    /// 是否允许在输出歧义时请求人工；关闭时按可重规划处理
    #[serde(default = "default_human_intervention")]
    pub human_intervention: bool,
    /// status() 返回的日志尾部条数
    #[serde(default = "default_status_tail")]
    pub status_tail: usize,
}

fn default_max_parallelism() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_refinements() -> u32 {
    3
}

fn default_max_plan_attempts() -> u32 {
    3
}

fn default_human_deadline_secs() -> u64 {
    60
}

fn default_human_intervention() -> bool {
    true
}

fn default_status_tail() -> usize {
    20
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            max_retries: default_max_retries(),
            max_refinements: default_max_refinements(),
            max_plan_attempts: default_max_plan_attempts(),
            human_deadline_secs: default_human_deadline_secs(),
            human_intervention: default_human_intervention(),
            status_tail: default_status_tail(),
        }
    }
}

/// [sandbox] 段：超时、内存与输出上限、参数个数上限、危险输入模式
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    /// 单次工具调用超时（秒），同时作为 CPU 时间上限
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// 内存上限：参数与结果序列化后的字节数之和
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: usize,
    /// 工具结果序列化后的最大字节数
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_max_args")]
    pub max_args: usize,
    /// 参数中出现即视为违规的正则
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
    /// 保留的最近执行记录条数
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_memory_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_max_args() -> usize {
    20
}

fn default_deny_patterns() -> Vec<String> {
    vec![
        r"eval\(".into(),
        r"exec\(".into(),
        r"os\.system".into(),
        r"subprocess".into(),
        r"import ".into(),
        r"file://".into(),
        r"https?://".into(),
        r"ftp://".into(),
    ]
}

fn default_history_limit() -> usize {
    1000
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            max_memory_bytes: default_max_memory_bytes(),
            max_output_bytes: default_max_output_bytes(),
            max_args: default_max_args(),
            deny_patterns: default_deny_patterns(),
            history_limit: default_history_limit(),
        }
    }
}

/// [recorder] 段：执行记录存储
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RecorderSection {
    #[serde(default)]
    pub backend: RecorderBackend,
    /// SQLite 文件路径（backend = "sqlite" 时使用），未设置时用 ./hive-records.db
    pub path: Option<PathBuf>,
}

impl RecorderSection {
    pub fn sqlite_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from("hive-records.db"))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecorderBackend {
    #[default]
    Memory,
    Sqlite,
}

/// 编排器的不可变运行配置（构造 Dispatcher 时传入）
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_parallelism: usize,
    pub max_retries: u32,
    pub max_refinements: u32,
    pub max_plan_attempts: u32,
    pub human_deadline: Duration,
    pub human_intervention: bool,
    pub status_tail: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        let o = &config.orchestrator;
        Self {
            max_parallelism: o.max_parallelism.max(1),
            max_retries: o.max_retries,
            max_refinements: o.max_refinements,
            max_plan_attempts: o.max_plan_attempts.max(1),
            human_deadline: Duration::from_secs(o.human_deadline_secs),
            human_intervention: o.human_intervention,
            status_tail: o.status_tail,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
