//! 规划层：策略、评审与重规划引擎

pub mod critic;
pub mod engine;
pub mod llm_strategy;
pub mod strategy;

pub use critic::PlanCritic;
pub use engine::{resolve_drafts, PlanRefinementEngine};
pub use llm_strategy::{parse_drafts, LlmPlanningStrategy};
pub use strategy::{drafts_from_plan, DraftInput, FixedPlanStrategy, PlanningStrategy};
