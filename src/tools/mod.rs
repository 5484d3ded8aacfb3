pub mod echo;
pub mod error;
pub mod registry;
pub mod schema;
pub mod sleep;

pub use echo::EchoTool;
pub use error::{ToolError, ToolErrorKind};
pub use registry::{Tool, ToolRegistry};
pub use schema::{plan_draft_schema_json, schema_value, validate_args};
pub use sleep::SleepTool;
