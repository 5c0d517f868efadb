use serde::Serialize;
use serde_json::Value;

use super::{StepResult, WorkflowStatus};
use crate::error::{ErrorInfo, WorkflowError};

/// Final result of one execution instance.
///
/// Always carries the status, the failing step (if any), the structured error
/// and the full trace up to the point execution stopped.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub workflow: String,
    pub status: WorkflowStatus,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub trace: Vec<StepResult>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub depth: usize,
    #[serde(skip)]
    pub cause: Option<WorkflowError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == WorkflowStatus::Failed
    }

    pub fn is_halted(&self) -> bool {
        self.status == WorkflowStatus::Halted
    }

    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.trace.iter().find(|r| r.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.trace.iter().map(|r| r.name.as_str()).collect()
    }

    /// Final output, or the error that ended the execution. A halted
    /// execution counts as a deliberate early success.
    pub fn into_output(self) -> Result<Value, WorkflowError> {
        match self.status {
            WorkflowStatus::Success | WorkflowStatus::Halted => Ok(self.output),
            _ => Err(self.cause.unwrap_or_else(|| WorkflowError::Failed {
                step: self.failed_step,
                message: self
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "workflow did not complete".to_string()),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use serde_json::json;

    fn result(status: WorkflowStatus) -> ExecutionResult {
        ExecutionResult {
            execution_id: "exec-1".into(),
            workflow: "review".into(),
            status,
            output: json!({"ok": true}),
            failed_step: None,
            error: None,
            trace: vec![
                StepResult::success("extract", json!(1)),
                StepResult::success("classify", json!(2)),
            ],
            total_cost: 0.0,
            total_tokens: 0,
            duration_ms: 0,
            depth: 0,
            cause: None,
        }
    }

    #[test]
    fn test_trace_lookup() {
        let r = result(WorkflowStatus::Success);
        assert_eq!(r.step_names(), vec!["extract", "classify"]);
        assert_eq!(r.step("classify").map(|s| s.content.clone()), Some(json!(2)));
        assert!(r.step("missing").is_none());
    }

    #[test]
    fn test_halted_output_is_ok() {
        assert_eq!(
            result(WorkflowStatus::Halted).into_output().unwrap(),
            json!({"ok": true})
        );
    }

    #[test]
    fn test_failed_output_surfaces_cause() {
        let mut r = result(WorkflowStatus::Failed);
        r.failed_step = Some("classify".into());
        r.cause = Some(WorkflowError::from_step(
            "classify",
            "exec-1",
            StepError::message("boom"),
        ));
        match r.into_output() {
            Err(WorkflowError::StepExecution { step, .. }) => assert_eq!(step, "classify"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_serialized_result_omits_cause() {
        let value = serde_json::to_value(result(WorkflowStatus::Success)).unwrap();
        assert_eq!(value["status"], "success");
        assert!(value.get("cause").is_none());
        assert_eq!(value["trace"][0]["name"], "extract");
    }
}
