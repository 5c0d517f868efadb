use async_trait::async_trait;
use std::sync::Arc;

use super::{Middleware, Next, BUDGET};
use crate::core::execution_context::ExecutionContext;
use crate::error::StepError;
use crate::infrastructure::{BudgetAuthority, BudgetError, Enforcement};

/// Consults the budget authority before the invocation.
///
/// Only a hard-enforced overrun blocks. Soft overruns and failures of the
/// authority itself are logged and the invocation proceeds.
pub struct BudgetMiddleware {
    authority: Arc<dyn BudgetAuthority>,
}

impl BudgetMiddleware {
    pub fn new(authority: Arc<dyn BudgetAuthority>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl Middleware for BudgetMiddleware {
    fn name(&self) -> &str {
        BUDGET
    }

    async fn call(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<(), StepError> {
        let verdict = self
            .authority
            .check(&ctx.agent, ctx.tenant_id.as_deref(), ctx.execution_type)
            .await;

        match verdict {
            Ok(()) => {}
            Err(e) if e.enforcement() == Some(Enforcement::Hard) => {
                tracing::warn!(
                    agent = %ctx.agent,
                    tenant_id = ?ctx.tenant_id,
                    error = %e,
                    "invocation blocked by budget"
                );
                return Err(StepError::BudgetExceeded(e.to_string()));
            }
            Err(e @ BudgetError::Unavailable(_)) => {
                tracing::warn!(
                    agent = %ctx.agent,
                    tenant_id = ?ctx.tenant_id,
                    error = %e,
                    "budget check failed, allowing invocation"
                );
                ctx.metadata
                    .insert("budget_check_failed".to_string(), true.into());
            }
            Err(e) => {
                tracing::warn!(
                    agent = %ctx.agent,
                    tenant_id = ?ctx.tenant_id,
                    error = %e,
                    "soft budget exceeded"
                );
                ctx.metadata
                    .insert("budget_exceeded".to_string(), true.into());
            }
        }

        next.run(ctx).await
    }
}
