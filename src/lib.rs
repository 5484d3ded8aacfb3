//! Hive - Rust 智能体任务编排核心
//!
//! 模块划分：
//! - **dispatcher**: 编排入口（提交任务、查询状态、取消、人工应答）
//! - **planner**: 规划策略、结构评审与重规划引擎
//! - **actor**: 单会话执行循环（晋升、派发、恢复、人工等待）
//! - **sandbox**: 工具调用隔离执行（白名单、输入过滤、超时、统计）
//! - **recorder**: 只追加的执行记录与回放（内存 / SQLite）
//! - **human**: 人工介入请求与截止
//! - **plan**: 任务、步骤、计划与 DAG
//! - **tools**: Tool trait、注册表与参数 Schema
//! - **core**: 错误分类、恢复策略、会话状态、并发调度
//! - **llm**: LLM 客户端抽象（规划策略使用）
//! - **config** / **observability**: 配置加载与日志

pub mod actor;
pub mod config;
pub mod context;
pub mod core;
pub mod dispatcher;
pub mod human;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod planner;
pub mod recorder;
pub mod sandbox;
pub mod tools;

pub use dispatcher::{DispatcherBuilder, SessionHandle, SessionOutcome, SessionSnapshot, TaskDispatcher};
