use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use super::{UnitOfWork, UnitOutput, Usage};
use crate::core::execution_context::{ExecutionContext, ExecutionType};
use crate::error::StepError;
use crate::middleware::{Pipeline, PipelineConfig};

/// The actual work behind an agent: the innermost link of its pipeline.
///
/// Reads the resolved model, parameters and input from the context.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn perform(&self, ctx: &ExecutionContext) -> Result<UnitOutput, StepError>;
}

/// A unit of work whose every invocation runs through a middleware pipeline.
pub struct Agent {
    name: String,
    version: String,
    model: String,
    parameters: Value,
    execution_type: ExecutionType,
    pipeline: Arc<Pipeline>,
    worker: Arc<dyn Worker>,
}

/// Result of one agent invocation: the root context (with retries linked
/// through `retry`) and the outcome.
#[derive(Debug)]
pub struct Invocation {
    pub context: ExecutionContext,
    pub result: Result<Value, StepError>,
}

impl Agent {
    pub fn builder(name: impl Into<String>, worker: Arc<dyn Worker>) -> AgentBuilder {
        AgentBuilder {
            name: name.into(),
            version: "1.0".to_string(),
            model: "default".to_string(),
            parameters: Value::Object(Map::new()),
            execution_type: ExecutionType::default(),
            pipeline: None,
            worker,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub async fn invoke(&self, input: Value) -> Invocation {
        self.invoke_with(ExecutionContext::new(self.name.clone(), input))
            .await
    }

    /// Runs a caller-prepared context, e.g. one with a tenant already set.
    pub async fn invoke_with(&self, mut ctx: ExecutionContext) -> Invocation {
        ctx.agent = self.name.clone();
        ctx.agent_version = self.version.clone();
        ctx.execution_type = self.execution_type;
        if ctx.model.is_empty() {
            ctx.model = self.model.clone();
        }
        if ctx.parameters.as_object().map_or(true, Map::is_empty) {
            ctx.parameters = self.parameters.clone();
        }

        let result = self.pipeline.execute(&mut ctx, self.worker.as_ref()).await;
        let result = result.map(|()| {
            ctx.final_attempt()
                .output
                .clone()
                .unwrap_or(Value::Null)
        });
        Invocation {
            context: ctx,
            result,
        }
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("model", &self.model)
            .field("pipeline", &self.pipeline.names())
            .finish()
    }
}

#[async_trait]
impl UnitOfWork for Agent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, input: Value) -> Result<UnitOutput, StepError> {
        let invocation = self.invoke(input).await;
        let content = invocation.result?;
        let mut usage = Usage::default();
        for attempt in invocation.context.attempts() {
            usage.add(&Usage::new(
                attempt.input_tokens,
                attempt.output_tokens,
                attempt.cost,
            ));
        }
        Ok(UnitOutput::new(content).with_usage(usage))
    }
}

pub struct AgentBuilder {
    name: String,
    version: String,
    model: String,
    parameters: Value,
    execution_type: ExecutionType,
    pipeline: Option<Arc<Pipeline>>,
    worker: Arc<dyn Worker>,
}

impl AgentBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn execution_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }

    /// Shared pipeline; defaults to the standard chain with only tenant
    /// resolution and instrumentation.
    pub fn pipeline(mut self, pipeline: Arc<Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            name: self.name,
            version: self.version,
            model: self.model,
            parameters: self.parameters,
            execution_type: self.execution_type,
            pipeline: self
                .pipeline
                .unwrap_or_else(|| Pipeline::standard(PipelineConfig::default())),
            worker: self.worker,
        }
    }
}
