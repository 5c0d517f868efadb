//! Error types for the orchestration engine.
//!
//! - [`StepError`]: Errors raised by a single step attempt or unit-of-work invocation.
//! - [`WorkflowError`]: Top-level errors for definitions and executions.
//! - [`ErrorCode`] / [`ErrorInfo`]: Structured, serializable error descriptions.

pub mod error_context;
pub mod step_error;
pub mod workflow_error;

pub use error_context::{ErrorCode, ErrorInfo};
pub use step_error::StepError;
pub use workflow_error::WorkflowError;

/// Convenience alias for workflow-level results.
pub type WorkflowResult<T> = Result<T, WorkflowError>;
/// Convenience alias for step-level results.
pub type UnitResult<T> = Result<T, StepError>;
