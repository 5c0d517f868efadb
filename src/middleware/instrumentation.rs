use async_trait::async_trait;
use std::sync::Arc;

use super::{Middleware, Next, INSTRUMENTATION};
use crate::core::execution_context::ExecutionContext;
use crate::core::runtime_context::TimeProvider;
use crate::error::StepError;
use crate::infrastructure::{BudgetAuthority, ExecutionSink};

/// Times every attempt, hands its snapshot to the execution sink and records
/// spend with the budget authority. Sits outside the cache so cache hits are
/// recorded too.
pub struct InstrumentationMiddleware {
    sink: Arc<dyn ExecutionSink>,
    budget: Option<Arc<dyn BudgetAuthority>>,
    time_provider: Arc<dyn TimeProvider>,
}

impl InstrumentationMiddleware {
    pub fn new(
        sink: Arc<dyn ExecutionSink>,
        budget: Option<Arc<dyn BudgetAuthority>>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            sink,
            budget,
            time_provider,
        }
    }
}

#[async_trait]
impl Middleware for InstrumentationMiddleware {
    fn name(&self) -> &str {
        INSTRUMENTATION
    }

    async fn call(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<(), StepError> {
        if ctx.attempt == 0 {
            ctx.attempt = 1;
        }
        if ctx.model_attempt == 0 {
            ctx.model_attempt = 1;
        }
        ctx.started_at = Some(self.time_provider.now());

        let result = next.run(ctx).await;

        ctx.completed_at = Some(self.time_provider.now());
        if let Err(e) = &result {
            if ctx.error.is_none() {
                ctx.error = Some(e.to_info());
            }
        }
        if ctx.cached {
            ctx.cost = 0.0;
        }

        tracing::debug!(
            agent = %ctx.agent,
            attempt = ctx.attempt,
            model = %ctx.model,
            cached = ctx.cached,
            success = result.is_ok(),
            duration_ms = ?ctx.duration_ms(),
            "attempt finished"
        );
        self.sink.record(ctx.to_record()).await;

        if let (Some(authority), Some(tenant)) = (&self.budget, &ctx.tenant_id) {
            if !ctx.cached {
                if let Err(e) = authority
                    .record_spend(tenant, ctx.cost, ctx.total_tokens())
                    .await
                {
                    tracing::warn!(tenant_id = %tenant, error = %e, "failed to record spend");
                }
            }
        }

        result
    }
}
