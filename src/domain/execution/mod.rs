//! Execution-time types: statuses, step results, flow-control outcomes and
//! the final execution result.

mod outcome;
mod result;
mod scope;
mod status;
mod step_result;

pub use outcome::StepOutcome;
pub use result::ExecutionResult;
pub use scope::StepScope;
pub use status::{StepStatus, WorkflowStatus};
pub use step_result::{ItemResult, IterationResults, StepResult};
