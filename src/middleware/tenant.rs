use async_trait::async_trait;
use std::sync::Arc;

use super::{Middleware, Next, TENANT};
use crate::core::execution_context::ExecutionContext;
use crate::error::StepError;

/// Resolves the tenant an invocation is billed to.
pub trait TenantResolver: Send + Sync {
    fn resolve(&self, ctx: &ExecutionContext) -> Option<String>;
}

/// Reads the tenant id from a field of the invocation input.
pub struct InputTenantResolver {
    field: String,
}

impl InputTenantResolver {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }
}

impl Default for InputTenantResolver {
    fn default() -> Self {
        Self::new("tenant_id")
    }
}

impl TenantResolver for InputTenantResolver {
    fn resolve(&self, ctx: &ExecutionContext) -> Option<String> {
        ctx.input
            .get(&self.field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Always resolves to the same tenant.
pub struct StaticTenantResolver(pub String);

impl TenantResolver for StaticTenantResolver {
    fn resolve(&self, _ctx: &ExecutionContext) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Sets `ctx.tenant_id` unless an earlier layer or the caller already did.
pub struct TenantMiddleware {
    resolver: Arc<dyn TenantResolver>,
}

impl TenantMiddleware {
    pub fn new(resolver: Arc<dyn TenantResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Middleware for TenantMiddleware {
    fn name(&self) -> &str {
        TENANT
    }

    async fn call(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<(), StepError> {
        if ctx.tenant_id.is_none() {
            ctx.tenant_id = self.resolver.resolve(ctx);
        }
        tracing::debug!(agent = %ctx.agent, tenant_id = ?ctx.tenant_id, "tenant resolved");
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_resolver_reads_field() {
        let ctx = ExecutionContext::new("a", json!({"tenant_id": "acme"}));
        assert_eq!(
            InputTenantResolver::default().resolve(&ctx).as_deref(),
            Some("acme")
        );
        let ctx = ExecutionContext::new("a", json!({"org": "globex"}));
        assert_eq!(
            InputTenantResolver::new("org").resolve(&ctx).as_deref(),
            Some("globex")
        );
        assert_eq!(InputTenantResolver::default().resolve(&ctx), None);
    }
}
