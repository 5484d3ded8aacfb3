pub mod builder;
pub mod graph;
pub mod types;

pub use builder::{PlanBuilder, StepDraft, BINDING_KEY};
pub use graph::PlanGraph;
pub use types::*;
