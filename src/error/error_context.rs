use serde::{Deserialize, Serialize};
use std::fmt;

/// Error classification code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Definition / input
    Validation,
    Definition,
    Config,
    UnknownStep,
    InputMapping,

    // Step execution
    StepTimeout,
    StepExecution,
    NoRouteMatched,
    WaitTimeout,
    ApprovalRejected,
    Cancelled,

    // Cross-cutting
    BudgetExceeded,
    RecursionLimitExceeded,

    // Workflow level
    WorkflowHalted,
    WorkflowFailed,
    WorkflowTimeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::Definition => "definition",
            ErrorCode::Config => "config",
            ErrorCode::UnknownStep => "unknown_step",
            ErrorCode::InputMapping => "input_mapping",
            ErrorCode::StepTimeout => "step_timeout",
            ErrorCode::StepExecution => "step_execution",
            ErrorCode::NoRouteMatched => "no_route_matched",
            ErrorCode::WaitTimeout => "wait_timeout",
            ErrorCode::ApprovalRejected => "approval_rejected",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::BudgetExceeded => "budget_exceeded",
            ErrorCode::RecursionLimitExceeded => "recursion_limit_exceeded",
            ErrorCode::WorkflowHalted => "workflow_halted",
            ErrorCode::WorkflowFailed => "workflow_failed",
            ErrorCode::WorkflowTimeout => "workflow_timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, serializable description of a failure, carried by step
/// results, execution records and the final execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    /// Error class used for `retryable_errors` matching (e.g. `timeout`,
    /// `rate_limited`).
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serde_snake_case() {
        let json = serde_json::to_string(&ErrorCode::RecursionLimitExceeded).unwrap();
        assert_eq!(json, "\"recursion_limit_exceeded\"");
        let back: ErrorCode = serde_json::from_str("\"step_timeout\"").unwrap();
        assert_eq!(back, ErrorCode::StepTimeout);
    }

    #[test]
    fn test_error_info_display() {
        let info = ErrorInfo::new(ErrorCode::StepExecution, "rate_limited", "slow down");
        assert_eq!(info.to_string(), "[rate_limited] slow down");
        assert_eq!(ErrorCode::StepExecution.to_string(), "step_execution");
    }
}
