//! Middleware pipeline wrapped around every agent invocation.
//!
//! Middleware `i` calls middleware `i + 1` through [`Next`]; the innermost
//! link calls the agent's [`Worker`]. The canonical order, outermost first:
//!
//! ```text
//! tenant -> budget -> instrumentation -> cache -> reliability -> worker
//! ```
//!
//! A pipeline is built once per agent type and shared.

mod budget;
mod cache;
mod instrumentation;
mod reliability;
mod tenant;

pub use budget::BudgetMiddleware;
pub use cache::{cache_key, CacheMiddleware};
pub use instrumentation::InstrumentationMiddleware;
pub use reliability::{ReliabilityMiddleware, ReliabilityPolicy};
pub use tenant::{InputTenantResolver, StaticTenantResolver, TenantMiddleware, TenantResolver};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::core::execution_context::ExecutionContext;
use crate::core::runtime_context::{RealTimeProvider, TimeProvider};
use crate::error::{StepError, WorkflowError};
use crate::infrastructure::{BudgetAuthority, CacheStore, ExecutionSink, TracingExecutionSink};
use crate::units::Worker;

pub const TENANT: &str = "tenant";
pub const BUDGET: &str = "budget";
pub const INSTRUMENTATION: &str = "instrumentation";
pub const CACHE: &str = "cache";
pub const RELIABILITY: &str = "reliability";

/// One link of the pipeline.
///
/// A middleware may short-circuit by setting `ctx.output` and returning
/// without calling `next`. Errors it does not handle must be propagated.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<(), StepError>;
}

/// The remainder of the chain after the current middleware.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    index: usize,
    worker: &'a dyn Worker,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        match self.chain.get(self.index) {
            Some(middleware) => {
                let next = Next {
                    index: self.index + 1,
                    ..self
                };
                middleware.call(ctx, next).await
            }
            None => {
                let output = self.worker.perform(ctx).await?;
                ctx.output = Some(output.content);
                ctx.input_tokens = output.usage.input_tokens;
                ctx.output_tokens = output.usage.output_tokens;
                ctx.cost = output.usage.cost;
                Ok(())
            }
        }
    }

    /// Chain positioned at the named middleware. When the name is absent
    /// this link is returned unchanged.
    pub fn restart_at(self, name: &str) -> Next<'a> {
        match self.chain.iter().position(|m| m.name() == name) {
            Some(index) => Next { index, ..self },
            None => self,
        }
    }
}

/// An immutable, shareable middleware chain.
#[derive(Clone, Default)]
pub struct Pipeline {
    chain: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// The canonical chain for the given collaborators.
    pub fn standard(config: PipelineConfig) -> Arc<Pipeline> {
        PipelineBuilder::standard(config).build()
    }

    pub fn names(&self) -> Vec<&str> {
        self.chain.iter().map(|m| m.name()).collect()
    }

    pub async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        worker: &dyn Worker,
    ) -> Result<(), StepError> {
        Next {
            chain: &self.chain,
            index: 0,
            worker,
        }
        .run(ctx)
        .await
    }
}

/// Collaborators of the canonical pipeline. Optional layers are left out
/// when their collaborator is `None`.
pub struct PipelineConfig {
    pub tenant: Option<Arc<dyn TenantResolver>>,
    pub budget: Option<Arc<dyn BudgetAuthority>>,
    pub sink: Arc<dyn ExecutionSink>,
    pub cache: Option<Arc<dyn CacheStore>>,
    pub cache_ttl: Option<Duration>,
    pub reliability: Option<ReliabilityPolicy>,
    pub time_provider: Arc<dyn TimeProvider>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tenant: Some(Arc::new(InputTenantResolver::default())),
            budget: None,
            sink: Arc::new(TracingExecutionSink),
            cache: None,
            cache_ttl: None,
            reliability: None,
            time_provider: Arc::new(RealTimeProvider),
        }
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    chain: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    pub fn standard(config: PipelineConfig) -> Self {
        let mut builder = Self::default();
        if let Some(resolver) = config.tenant {
            builder = builder.append(TenantMiddleware::new(resolver));
        }
        if let Some(authority) = config.budget.clone() {
            builder = builder.append(BudgetMiddleware::new(authority));
        }
        builder = builder.append(InstrumentationMiddleware::new(
            config.sink,
            config.budget,
            config.time_provider,
        ));
        if let Some(store) = config.cache {
            builder = builder.append(CacheMiddleware::new(store, config.cache_ttl));
        }
        if let Some(policy) = config.reliability {
            builder = builder.append(ReliabilityMiddleware::new(policy));
        }
        builder
    }

    pub fn append<M: Middleware + 'static>(self, middleware: M) -> Self {
        self.append_arc(Arc::new(middleware))
    }

    pub fn append_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.chain.push(middleware);
        self
    }

    pub fn insert_before<M: Middleware + 'static>(
        mut self,
        anchor: &str,
        middleware: M,
    ) -> Result<Self, WorkflowError> {
        let index = self.position(anchor)?;
        self.chain.insert(index, Arc::new(middleware));
        Ok(self)
    }

    pub fn insert_after<M: Middleware + 'static>(
        mut self,
        anchor: &str,
        middleware: M,
    ) -> Result<Self, WorkflowError> {
        let index = self.position(anchor)?;
        self.chain.insert(index + 1, Arc::new(middleware));
        Ok(self)
    }

    pub fn remove(mut self, name: &str) -> Result<Self, WorkflowError> {
        let index = self.position(name)?;
        self.chain.remove(index);
        Ok(self)
    }

    pub fn names(&self) -> Vec<&str> {
        self.chain.iter().map(|m| m.name()).collect()
    }

    pub fn build(self) -> Arc<Pipeline> {
        Arc::new(Pipeline { chain: self.chain })
    }

    fn position(&self, name: &str) -> Result<usize, WorkflowError> {
        self.chain
            .iter()
            .position(|m| m.name() == name)
            .ok_or_else(|| {
                WorkflowError::Definition(format!("no middleware named '{}' in pipeline", name))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitOutput;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn call(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<(), StepError> {
            self.log.lock().push(format!("enter {}", self.name));
            let result = next.run(ctx).await;
            self.log.lock().push(format!("exit {}", self.name));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &str {
            "short"
        }

        async fn call(&self, ctx: &mut ExecutionContext, _next: Next<'_>) -> Result<(), StepError> {
            ctx.output = Some(json!("short-circuited"));
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn perform(&self, ctx: &ExecutionContext) -> Result<UnitOutput, StepError> {
            Ok(UnitOutput::new(ctx.input.clone()))
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
        Recorder {
            name,
            log: log.clone(),
        }
    }

    #[tokio::test]
    async fn test_chain_runs_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder()
            .append(recorder("a", &log))
            .append(recorder("b", &log))
            .build();
        let mut ctx = ExecutionContext::new("echo", json!("hi"));
        pipeline.execute(&mut ctx, &Echo).await.unwrap();
        assert_eq!(ctx.output, Some(json!("hi")));
        assert_eq!(
            *log.lock(),
            vec!["enter a", "enter b", "exit b", "exit a"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_worker() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder()
            .append(recorder("outer", &log))
            .append(ShortCircuit)
            .append(recorder("inner", &log))
            .build();
        let mut ctx = ExecutionContext::new("echo", Value::Null);
        pipeline.execute(&mut ctx, &Echo).await.unwrap();
        assert_eq!(ctx.output, Some(json!("short-circuited")));
        assert_eq!(*log.lock(), vec!["enter outer", "exit outer"]);
    }

    #[test]
    fn test_insert_and_remove_by_name() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let builder = Pipeline::builder()
            .append(recorder("a", &log))
            .append(recorder("c", &log))
            .insert_before("c", recorder("b", &log))
            .unwrap()
            .insert_after("c", recorder("d", &log))
            .unwrap();
        assert_eq!(builder.names(), vec!["a", "b", "c", "d"]);
        let builder = builder.remove("b").unwrap();
        assert_eq!(builder.names(), vec!["a", "c", "d"]);
        assert!(matches!(
            builder.remove("missing"),
            Err(WorkflowError::Definition(_))
        ));
    }

    #[test]
    fn test_standard_order() {
        let pipeline = Pipeline::standard(PipelineConfig {
            budget: Some(Arc::new(crate::infrastructure::InMemoryBudgetAuthority::default())),
            cache: Some(Arc::new(crate::infrastructure::InMemoryCacheStore::default())),
            reliability: Some(ReliabilityPolicy::default()),
            ..PipelineConfig::default()
        });
        assert_eq!(
            pipeline.names(),
            vec![TENANT, BUDGET, INSTRUMENTATION, CACHE, RELIABILITY]
        );

        let minimal = Pipeline::standard(PipelineConfig::default());
        assert_eq!(minimal.names(), vec![TENANT, INSTRUMENTATION]);
    }
}
