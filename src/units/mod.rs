//! Units of work: the opaque actions a step invokes.
//!
//! - [`UnitOfWork`]: `execute(input) -> output | error`, the contract every
//!   step target satisfies.
//! - [`InlineBlock`]: in-process code that returns an explicit
//!   [`StepOutcome`](crate::domain::execution::StepOutcome).
//! - [`Agent`]: a unit whose invocation runs through the middleware pipeline.

mod agent;
mod block;

pub use agent::{Agent, AgentBuilder, Invocation, Worker};
pub use block::{FnBlock, InlineBlock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::error::StepError;

/// Token and cost usage reported by one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64, cost: f64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cost,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost += other.cost;
    }
}

/// Output of a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutput {
    pub content: Value,
    pub usage: Usage,
}

impl UnitOutput {
    pub fn new(content: Value) -> Self {
        Self {
            content,
            usage: Usage::default(),
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

impl From<Value> for UnitOutput {
    fn from(content: Value) -> Self {
        UnitOutput::new(content)
    }
}

/// Contract every step target invocation satisfies.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Identity used in traces, logs and cache keys.
    fn name(&self) -> &str;

    async fn execute(&self, input: Value) -> Result<UnitOutput, StepError>;
}

/// Unit of work backed by an async closure.
pub struct FnUnit<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> UnitOfWork for FnUnit<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<UnitOutput, StepError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> Result<UnitOutput, StepError> {
        (self.f)(input).await
    }
}

/// Wraps an async closure as a shareable unit of work.
pub fn unit_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn UnitOfWork>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnitOutput, StepError>> + Send + 'static,
{
    Arc::new(FnUnit {
        name: name.into(),
        f,
    })
}

/// Wraps a synchronous closure returning plain content.
pub fn sync_unit<F>(name: impl Into<String>, f: F) -> Arc<dyn UnitOfWork>
where
    F: Fn(Value) -> Result<Value, StepError> + Send + Sync + 'static,
{
    unit_fn(name, move |input| {
        let result = f(input).map(UnitOutput::new);
        async move { result }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sync_unit() {
        let unit = sync_unit("upper", |input| {
            Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
        });
        assert_eq!(unit.name(), "upper");
        let out = unit.execute(json!("hi")).await.unwrap();
        assert_eq!(out.content, json!("HI"));
        assert_eq!(out.usage, Usage::default());
    }

    #[tokio::test]
    async fn test_async_unit_reports_usage() {
        let unit = unit_fn("llm", |_| async {
            Ok(UnitOutput::new(json!("ok")).with_usage(Usage::new(10, 5, 0.25)))
        });
        let out = unit.execute(json!({})).await.unwrap();
        assert_eq!(out.usage.total_tokens(), 15);
    }

    #[test]
    fn test_usage_add() {
        let mut total = Usage::default();
        total.add(&Usage::new(1, 2, 0.5));
        total.add(&Usage::new(3, 4, 0.25));
        assert_eq!(total, Usage::new(4, 6, 0.75));
    }
}
