use serde_json::Value;

/// Explicit flow-control result of an inline block.
///
/// Blocks return one of these instead of unwinding through the error channel;
/// the step executor interprets it.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Normal completion with the step content.
    Continue(Value),
    /// Mark the step skipped, substituting `default` as its content.
    Skip {
        reason: String,
        default: Option<Value>,
    },
    /// Stop the whole workflow with `halted` status and this final output.
    Halt(Value),
    /// Abort as a critical failure.
    Fail(String),
    /// Ask for another attempt outside the error-triggered retry path.
    RetryRequested(String),
}

impl StepOutcome {
    pub fn skip(reason: impl Into<String>, default: Option<Value>) -> Self {
        StepOutcome::Skip {
            reason: reason.into(),
            default,
        }
    }

    pub fn halt(output: Value) -> Self {
        StepOutcome::Halt(output)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        StepOutcome::Fail(message.into())
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        StepOutcome::RetryRequested(reason.into())
    }
}

impl From<Value> for StepOutcome {
    fn from(value: Value) -> Self {
        StepOutcome::Continue(value)
    }
}
