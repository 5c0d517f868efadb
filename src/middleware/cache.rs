use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::{Middleware, Next, CACHE};
use crate::core::execution_context::ExecutionContext;
use crate::error::StepError;
use crate::infrastructure::CacheStore;

/// Serves repeated invocations from the cache store.
///
/// A hit sets the output, marks the context cached and returns without
/// calling the rest of the chain. Only successful first attempts are written;
/// retried attempts are written by the attempt that produced the output.
pub struct CacheMiddleware {
    store: Arc<dyn CacheStore>,
    ttl: Option<Duration>,
}

impl CacheMiddleware {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Option<Duration>) -> Self {
        Self { store, ttl }
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    fn name(&self) -> &str {
        CACHE
    }

    async fn call(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<(), StepError> {
        let key = match &ctx.cache_key {
            Some(key) => key.clone(),
            None => {
                let key = cache_key(ctx);
                ctx.cache_key = Some(key.clone());
                key
            }
        };

        if let Some(hit) = self.store.read(&key).await {
            tracing::debug!(agent = %ctx.agent, key = %key, "cache hit");
            ctx.output = Some(hit);
            ctx.cached = true;
            ctx.cost = 0.0;
            ctx.input_tokens = 0;
            ctx.output_tokens = 0;
            return Ok(());
        }

        next.run(ctx).await?;

        if ctx.retry.is_none() && ctx.is_success() {
            if let Some(output) = &ctx.output {
                self.store.write(&key, output.clone(), self.ttl).await;
            }
        }
        Ok(())
    }
}

/// Deterministic key over agent identity, version, model, parameters and a
/// content hash of the normalized input.
pub fn cache_key(ctx: &ExecutionContext) -> String {
    let payload = normalize(&json!({
        "parameters": ctx.parameters,
        "input": ctx.input,
    }));
    let digest = Sha256::digest(payload.to_string().as_bytes());
    let hash: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "stepwise/{}/{}/{}/{}",
        ctx.agent, ctx.agent_version, ctx.model, hash
    )
}

/// Sorts object keys and trims string values so that semantically equal
/// inputs hash the same.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), normalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(input: Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::new("summarizer", input);
        ctx.model = "gpt-4o".into();
        ctx
    }

    #[test]
    fn test_key_ignores_key_order_and_whitespace() {
        let a = cache_key(&ctx(json!({"text": "hello ", "lang": "en"})));
        let b = cache_key(&ctx(json!({"lang": "en", "text": "  hello"})));
        assert_eq!(a, b);
        assert!(a.starts_with("stepwise/summarizer/1.0/gpt-4o/"));
    }

    #[test]
    fn test_key_depends_on_model_and_parameters() {
        let base = cache_key(&ctx(json!({"text": "x"})));
        let mut other_model = ctx(json!({"text": "x"}));
        other_model.model = "gpt-4o-mini".into();
        assert_ne!(base, cache_key(&other_model));

        let mut other_params = ctx(json!({"text": "x"}));
        other_params.parameters = json!({"temperature": 0.2});
        assert_ne!(base, cache_key(&other_params));
    }
}
