//! # Stepwise: declarative workflow orchestration
//!
//! `stepwise` runs multi-step agent pipelines described as ordered lists of
//! steps. A workflow definition is built once, validated up front, and can be
//! executed any number of times concurrently:
//!
//! - **Steps**: each step invokes a unit of work (an agent, an inline block, a
//!   nested workflow or the current workflow recursively) with retries,
//!   timeouts, fallbacks, guards, throttling and rate limits.
//! - **Flow control**: parallel groups, routes keyed by a classifier, and
//!   per-item iteration with bounded concurrency.
//! - **Waits**: delays, polled conditions and human approvals with reminders,
//!   escalation and timeout policies.
//! - **Middleware**: every agent invocation runs through a pipeline of tenant
//!   resolution, budget enforcement, instrumentation, caching and
//!   reliability layers.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use stepwise::{sync_unit, FlowEngine, StepBuilder, WorkflowDefinition};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), stepwise::WorkflowError> {
//!     let shout = sync_unit("shout", |input| {
//!         Ok(json!(input["text"].as_str().unwrap_or_default().to_uppercase()))
//!     });
//!     let workflow = WorkflowDefinition::builder("greeting")
//!         .step(StepBuilder::new("shout", shout))
//!         .build()?;
//!
//!     let result = FlowEngine::new().run(&workflow, json!({ "text": "hi" })).await;
//!     println!("{}", result.into_output()?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod domain;
pub mod engine;
pub mod error;
pub mod infrastructure;
pub mod middleware;
pub mod units;
pub mod wait;

pub use crate::config::EngineConfig;
pub use crate::core::{
    create_event_channel, ExecutionContext, ExecutionRecord, ExecutionType, FakeIdGenerator,
    FakeTimeProvider, IdGenerator, RealIdGenerator, RealTimeProvider, RuntimeContext,
    ThrottleManager, TimeProvider, WorkflowEvent,
};
pub use crate::domain::execution::{
    ExecutionResult, ItemResult, IterationResults, StepOutcome, StepResult, StepScope, StepStatus,
    WorkflowStatus,
};
pub use crate::domain::model::{
    ApprovalSpec, Backoff, FieldSpec, FieldType, ParallelBuilder, PollSpec, RateLimit, RetryPolicy,
    RouteArm, RouteBuilder, Schema, StepBuilder, StepTarget, TimeoutPolicy, WaitBuilder,
    WorkflowBuilder, WorkflowDefinition,
};
pub use crate::engine::{FlowEngine, FlowEngineBuilder, HookPoint, Hooks, WorkflowSnapshot};
pub use crate::error::{ErrorCode, ErrorInfo, StepError, WorkflowError};
pub use crate::middleware::{Middleware, Next, Pipeline, PipelineBuilder, PipelineConfig};
pub use crate::units::{
    sync_unit, unit_fn, Agent, AgentBuilder, FnBlock, InlineBlock, Invocation, UnitOfWork,
    UnitOutput, Usage, Worker,
};
pub use crate::wait::{ApprovalError, WaitCoordinator, WaitState, WaitStatus};
