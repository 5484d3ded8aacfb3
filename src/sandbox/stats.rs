//! 沙箱执行统计与最近执行历史

use std::collections::VecDeque;

use serde::Serialize;

use crate::plan::StepId;

/// 历史中结果预览的最大字符数
const RESULT_PREVIEW_CHARS: usize = 1000;

/// 一次执行的摘要
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub tool: String,
    pub step_id: StepId,
    pub ok: bool,
    /// ok / error / timeout / rejected / panic
    pub outcome: &'static str,
    pub duration_ms: u64,
    pub result_preview: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// 汇总统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SandboxStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub total_duration_ms: u64,
}

/// 统计累加器，由 ToolSandbox 在锁内更新
#[derive(Debug)]
pub(crate) struct StatsBook {
    total: u64,
    successful: u64,
    failed: u64,
    total_duration_ms: u64,
    history: VecDeque<ExecutionSummary>,
    history_limit: usize,
}

impl StatsBook {
    pub(crate) fn new(history_limit: usize) -> Self {
        Self {
            total: 0,
            successful: 0,
            failed: 0,
            total_duration_ms: 0,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub(crate) fn record(&mut self, mut summary: ExecutionSummary) {
        self.total += 1;
        if summary.ok {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration_ms += summary.duration_ms;

        summary.result_preview = truncate_chars(&summary.result_preview, RESULT_PREVIEW_CHARS);
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    pub(crate) fn snapshot(&self) -> SandboxStats {
        let (success_rate, avg_duration_ms) = if self.total == 0 {
            (0.0, 0.0)
        } else {
            (
                self.successful as f64 / self.total as f64,
                self.total_duration_ms as f64 / self.total as f64,
            )
        };
        SandboxStats {
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            success_rate,
            avg_duration_ms,
            total_duration_ms: self.total_duration_ms,
        }
    }

    /// 最近 n 条（时间正序）
    pub(crate) fn recent(&self, n: usize) -> Vec<ExecutionSummary> {
        let skip = self.history.len().saturating_sub(n);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::new(self.history_limit);
    }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
