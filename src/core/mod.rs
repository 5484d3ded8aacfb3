//! 核心层：错误与恢复、可回放的会话状态、会话监管、步骤调度

pub mod error;
pub mod recovery;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use error::{FailureClass, OrchestratorError, PlanningError, RecorderError, TerminalReason};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use session_supervisor::SessionSupervisor;
pub use state::{HumanRequestRecord, PlanRevisionSummary, SessionState, SessionStatus};
pub use task_scheduler::TaskScheduler;
