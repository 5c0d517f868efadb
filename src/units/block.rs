use async_trait::async_trait;
use serde_json::Value;

use crate::domain::execution::{StepOutcome, StepScope};
use crate::error::StepError;

/// In-process step body. Flow control (skip, halt, fail, retry) travels in
/// the returned [`StepOutcome`]; `Err` is reserved for genuine failures.
#[async_trait]
pub trait InlineBlock: Send + Sync {
    async fn run(&self, scope: &StepScope, input: Value) -> Result<StepOutcome, StepError>;
}

/// Inline block backed by a synchronous closure.
pub struct FnBlock<F> {
    f: F,
}

impl<F> FnBlock<F>
where
    F: Fn(&StepScope, Value) -> Result<StepOutcome, StepError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> InlineBlock for FnBlock<F>
where
    F: Fn(&StepScope, Value) -> Result<StepOutcome, StepError> + Send + Sync,
{
    async fn run(&self, scope: &StepScope, input: Value) -> Result<StepOutcome, StepError> {
        (self.f)(scope, input)
    }
}
