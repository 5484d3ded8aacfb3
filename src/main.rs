//! Hive - 任务文件执行入口
//!
//! 用法：`hive <task.json> [config.toml]`
//!
//! 任务文件为 `{goal, allowed_tools, deadline?, plan}`，plan 是预置的步骤草稿，
//! 由确定性策略交给规划器评审后执行。结束后把终态与完整轨迹以 JSON 打印到 stdout。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::SessionStatus;
use hive::plan::{StepDraft, Task};
use hive::planner::FixedPlanStrategy;
use hive::tools::{EchoTool, SleepTool, ToolRegistry};
use hive::TaskDispatcher;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(flatten)]
    task: Task,
    #[serde(default)]
    plan: Vec<StepDraft>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let mut args = std::env::args().skip(1);
    let task_path = args.next().context("usage: hive <task.json> [config.toml]")?;
    let config_path = args.next().map(PathBuf::from);

    let app = load_config(config_path).context("Failed to load config")?;
    let raw = std::fs::read_to_string(&task_path)
        .with_context(|| format!("Failed to read task file {task_path}"))?;
    let file: TaskFile = serde_json::from_str(&raw).context("Invalid task file")?;

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(SleepTool);

    let dispatcher = Arc::new(
        TaskDispatcher::builder(Arc::new(registry), Arc::new(FixedPlanStrategy::new(file.plan)))
            .with_app_config(&app)
            .context("Failed to open execution recorder")?
            .build(),
    );

    let handle = dispatcher.submit(file.task).context("Task rejected")?;
    let session_id = handle.session_id().to_string();
    tracing::info!(session = %session_id, "session running");

    // Ctrl+C 取消会话，等待在途步骤结束后输出轨迹
    let canceller = dispatcher.clone();
    let cancel_id = session_id.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            tracing::info!(session = %cancel_id, "received Ctrl+C, cancelling session");
            let _ = canceller.cancel(&cancel_id);
        }
    });

    let outcome = handle.wait().await.context("Session did not finish")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?
    );

    if outcome.status != SessionStatus::Completed {
        std::process::exit(1);
    }
    Ok(())
}
