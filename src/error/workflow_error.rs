//! Workflow-level error types.

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::{ErrorCode, StepError};

/// Workflow-level errors
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Definition error: {0}")]
    Definition(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Step '{step}' timed out after {after:?}")]
    StepTimeout { step: String, after: Duration },
    #[error("Step '{step}' failed in execution {execution_id}: {source}")]
    StepExecution {
        step: String,
        execution_id: String,
        #[source]
        source: StepError,
    },
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("Recursion limit exceeded: depth {depth} exceeds max {max}")]
    RecursionLimitExceeded { depth: usize, max: usize },
    /// Deliberate early-success termination; not a failure.
    #[error("Workflow halted")]
    Halted { output: Value },
    #[error("Workflow failed at {step:?}: {message}")]
    Failed {
        step: Option<String>,
        message: String,
    },
    #[error("Workflow timed out after {0:?}")]
    Timeout(Duration),
}

impl WorkflowError {
    /// Lift an unrecovered step failure into the workflow taxonomy.
    pub fn from_step(step: &str, execution_id: &str, error: StepError) -> Self {
        match error.root_cause() {
            StepError::Timeout(after) => WorkflowError::StepTimeout {
                step: step.to_string(),
                after: *after,
            },
            StepError::BudgetExceeded(message) => WorkflowError::BudgetExceeded(message.clone()),
            StepError::RecursionLimitExceeded { depth, max } => {
                WorkflowError::RecursionLimitExceeded {
                    depth: *depth,
                    max: *max,
                }
            }
            StepError::Validation(message) => WorkflowError::Validation(message.clone()),
            StepError::Failed(message) => WorkflowError::Failed {
                step: Some(step.to_string()),
                message: message.clone(),
            },
            _ => WorkflowError::StepExecution {
                step: step.to_string(),
                execution_id: execution_id.to_string(),
                source: error,
            },
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            WorkflowError::Validation(_) => ErrorCode::Validation,
            WorkflowError::Definition(_) => ErrorCode::Definition,
            WorkflowError::Config(_) => ErrorCode::Config,
            WorkflowError::StepTimeout { .. } => ErrorCode::StepTimeout,
            WorkflowError::StepExecution { .. } => ErrorCode::StepExecution,
            WorkflowError::BudgetExceeded(_) => ErrorCode::BudgetExceeded,
            WorkflowError::RecursionLimitExceeded { .. } => ErrorCode::RecursionLimitExceeded,
            WorkflowError::Halted { .. } => ErrorCode::WorkflowHalted,
            WorkflowError::Failed { .. } => ErrorCode::WorkflowFailed,
            WorkflowError::Timeout(_) => ErrorCode::WorkflowTimeout,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, WorkflowError::Halted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_error_display() {
        assert_eq!(
            WorkflowError::Validation("x".into()).to_string(),
            "Validation error: x"
        );
        assert_eq!(
            WorkflowError::Definition("both if and unless".into()).to_string(),
            "Definition error: both if and unless"
        );
        assert_eq!(
            WorkflowError::RecursionLimitExceeded { depth: 4, max: 3 }.to_string(),
            "Recursion limit exceeded: depth 4 exceeds max 3"
        );
        assert_eq!(
            WorkflowError::Halted {
                output: Value::Null
            }
            .to_string(),
            "Workflow halted"
        );
    }

    #[test]
    fn test_from_step_maps_timeout() {
        let err = WorkflowError::from_step(
            "classify",
            "exec-1",
            StepError::Timeout(Duration::from_secs(5)),
        );
        match err {
            WorkflowError::StepTimeout { step, after } => {
                assert_eq!(step, "classify");
                assert_eq!(after, Duration::from_secs(5));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_from_step_wraps_unit_failure_with_context() {
        let err = WorkflowError::from_step("classify", "exec-1", StepError::message("bad"));
        let msg = err.to_string();
        assert!(msg.contains("classify"));
        assert!(msg.contains("exec-1"));
        assert!(msg.contains("bad"));
        assert_eq!(err.code(), ErrorCode::StepExecution);
    }

    #[test]
    fn test_halted_is_not_failure() {
        assert!(!WorkflowError::Halted {
            output: Value::Null
        }
        .is_failure());
        assert!(WorkflowError::Timeout(Duration::from_secs(1)).is_failure());
    }
}
