use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::{ErrorCode, ErrorInfo};
use crate::domain::execution::StepResult;

/// Failure of a single step attempt or unit-of-work invocation.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Failure reported by the unit of work itself. `kind` is the error class
    /// matched against a retry policy's `retryable_errors`.
    #[error("{kind}: {message}")]
    Unit { kind: String, message: String },
    #[error("Step timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unknown step: {0}")]
    UnknownStep(String),
    #[error("Input mapping error: {0}")]
    InputMapping(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),
    #[error("Recursion limit exceeded: depth {depth} exceeds max {max}")]
    RecursionLimitExceeded { depth: usize, max: usize },
    /// Deliberate abort (`fail!`) or an exhausted `retry!` request.
    #[error("Step failed: {0}")]
    Failed(String),
    #[error("No route matched classification '{0}'")]
    NoRoute(String),
    #[error("Wait timed out: {0}")]
    WaitTimeout(String),
    #[error("Approval rejected: {0}")]
    Rejected(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Iteration item {index} failed: {source}")]
    Iteration {
        index: usize,
        #[source]
        source: Box<StepError>,
    },
    #[error("Sub-workflow '{workflow}' failed: {source}")]
    SubWorkflow {
        workflow: String,
        step: Option<String>,
        #[source]
        source: Box<StepError>,
        trace: Arc<Vec<StepResult>>,
    },
}

impl StepError {
    /// Failure raised by a unit of work with an explicit error class.
    pub fn unit(kind: impl Into<String>, message: impl Into<String>) -> Self {
        StepError::Unit {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Generic unit failure (`kind = "error"`).
    pub fn message(message: impl Into<String>) -> Self {
        Self::unit("error", message)
    }

    /// Error class used for `retryable_errors` matching.
    pub fn kind(&self) -> &str {
        match self {
            StepError::Unit { kind, .. } => kind,
            StepError::Timeout(_) => "timeout",
            StepError::UnknownStep(_) => "unknown_step",
            StepError::InputMapping(_) => "input_mapping",
            StepError::Validation(_) => "validation",
            StepError::BudgetExceeded(_) => "budget_exceeded",
            StepError::RecursionLimitExceeded { .. } => "recursion_limit_exceeded",
            StepError::Failed(_) => "failed",
            StepError::NoRoute(_) => "no_route",
            StepError::WaitTimeout(_) => "wait_timeout",
            StepError::Rejected(_) => "rejected",
            StepError::Cancelled(_) => "cancelled",
            StepError::Iteration { source, .. } => source.kind(),
            StepError::SubWorkflow { source, .. } => source.kind(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            StepError::Unit { .. } => ErrorCode::StepExecution,
            StepError::Timeout(_) => ErrorCode::StepTimeout,
            StepError::UnknownStep(_) => ErrorCode::UnknownStep,
            StepError::InputMapping(_) => ErrorCode::InputMapping,
            StepError::Validation(_) => ErrorCode::Validation,
            StepError::BudgetExceeded(_) => ErrorCode::BudgetExceeded,
            StepError::RecursionLimitExceeded { .. } => ErrorCode::RecursionLimitExceeded,
            StepError::Failed(_) => ErrorCode::WorkflowFailed,
            StepError::NoRoute(_) => ErrorCode::NoRouteMatched,
            StepError::WaitTimeout(_) => ErrorCode::WaitTimeout,
            StepError::Rejected(_) => ErrorCode::ApprovalRejected,
            StepError::Cancelled(_) => ErrorCode::Cancelled,
            StepError::Iteration { source, .. } => source.code(),
            StepError::SubWorkflow { source, .. } => source.code(),
        }
    }

    /// Errors that no retry or fallback can fix.
    pub fn is_terminal(&self) -> bool {
        match self {
            StepError::UnknownStep(_)
            | StepError::Validation(_)
            | StepError::BudgetExceeded(_)
            | StepError::RecursionLimitExceeded { .. }
            | StepError::Cancelled(_) => true,
            StepError::Iteration { source, .. } | StepError::SubWorkflow { source, .. } => {
                source.is_terminal()
            }
            _ => false,
        }
    }

    /// Innermost error, unwrapping iteration and sub-workflow layers.
    pub fn root_cause(&self) -> &StepError {
        match self {
            StepError::Iteration { source, .. } | StepError::SubWorkflow { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.kind(), self.to_string())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        StepError::unit("serialization", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_display() {
        assert_eq!(
            StepError::unit("rate_limited", "429").to_string(),
            "rate_limited: 429"
        );
        assert_eq!(
            StepError::UnknownStep("extract".into()).to_string(),
            "Unknown step: extract"
        );
        assert_eq!(
            StepError::RecursionLimitExceeded { depth: 4, max: 3 }.to_string(),
            "Recursion limit exceeded: depth 4 exceeds max 3"
        );
        assert_eq!(
            StepError::NoRoute("spam".into()).to_string(),
            "No route matched classification 'spam'"
        );
    }

    #[test]
    fn test_step_error_kind_and_code() {
        let err = StepError::Timeout(Duration::from_secs(2));
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.code(), ErrorCode::StepTimeout);

        let err = StepError::message("boom");
        assert_eq!(err.kind(), "error");
        assert_eq!(err.code(), ErrorCode::StepExecution);
    }

    #[test]
    fn test_nested_errors_report_root_cause() {
        let inner = StepError::RecursionLimitExceeded { depth: 4, max: 3 };
        let nested = StepError::SubWorkflow {
            workflow: "tree".into(),
            step: Some("children".into()),
            source: Box::new(StepError::Iteration {
                index: 1,
                source: Box::new(inner),
            }),
            trace: Arc::new(Vec::new()),
        };
        assert_eq!(nested.code(), ErrorCode::RecursionLimitExceeded);
        assert!(nested.is_terminal());
        assert!(matches!(
            nested.root_cause(),
            StepError::RecursionLimitExceeded { depth: 4, max: 3 }
        ));
    }

    #[test]
    fn test_to_info() {
        let info = StepError::BudgetExceeded("tenant acme".into()).to_info();
        assert_eq!(info.code, ErrorCode::BudgetExceeded);
        assert_eq!(info.kind, "budget_exceeded");
        assert!(info.message.contains("tenant acme"));
    }
}
