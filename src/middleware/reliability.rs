use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Middleware, Next, INSTRUMENTATION, RELIABILITY};
use crate::core::execution_context::ExecutionContext;
use crate::domain::model::RetryPolicy;
use crate::error::StepError;

/// Retry budget per model plus an ordered list of fallback models.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReliabilityPolicy {
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

impl ReliabilityPolicy {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            fallback_models: Vec::new(),
        }
    }

    pub fn with_fallback_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_models = models.into_iter().map(Into::into).collect();
        self
    }
}

struct RetryPlan {
    model: String,
    fallback_index: usize,
    model_attempt: u32,
    delay: Duration,
}

/// Retries failed attempts and walks the fallback models.
///
/// Each retry runs on a fresh context from [`ExecutionContext::dup_for_retry`]
/// and re-enters the chain at the instrumentation layer, so every attempt is
/// recorded on its own. The attempts are linked through `ctx.retry`.
pub struct ReliabilityMiddleware {
    policy: ReliabilityPolicy,
}

impl ReliabilityMiddleware {
    pub fn new(policy: ReliabilityPolicy) -> Self {
        Self { policy }
    }

    fn plan(&self, failed: &ExecutionContext, error: &StepError) -> Option<RetryPlan> {
        if error.is_terminal() {
            return None;
        }
        let retry = &self.policy.retry;
        let model_attempt = failed.model_attempt.max(1);
        if retry.should_retry(error) && model_attempt <= retry.max_retries {
            return Some(RetryPlan {
                model: failed.model.clone(),
                fallback_index: failed.fallback_index,
                model_attempt: model_attempt + 1,
                delay: retry.delay_for(model_attempt),
            });
        }
        self.policy
            .fallback_models
            .get(failed.fallback_index)
            .map(|model| RetryPlan {
                model: model.clone(),
                fallback_index: failed.fallback_index + 1,
                model_attempt: 1,
                delay: Duration::ZERO,
            })
    }
}

#[async_trait]
impl Middleware for ReliabilityMiddleware {
    fn name(&self) -> &str {
        RELIABILITY
    }

    async fn call(&self, ctx: &mut ExecutionContext, next: Next<'_>) -> Result<(), StepError> {
        // Retry attempts pass back through this layer; the outermost
        // invocation owns the loop.
        if ctx.attempt > 1 {
            return next.run(ctx).await;
        }

        let mut last_error = match next.run(ctx).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        ctx.error = Some(last_error.to_info());

        let restart = next.restart_at(INSTRUMENTATION);
        let mut attempts: Vec<ExecutionContext> = Vec::new();
        let mut succeeded = false;

        loop {
            let previous: &ExecutionContext = attempts.last().unwrap_or(&*ctx);
            let Some(plan) = self.plan(previous, &last_error) else {
                break;
            };

            let mut retry_ctx = previous.dup_for_retry();
            retry_ctx.attempt = previous.attempt.max(1) + 1;
            retry_ctx.model_attempt = plan.model_attempt;
            retry_ctx.fallback_index = plan.fallback_index;
            if retry_ctx.model != plan.model {
                retry_ctx.model = plan.model;
                retry_ctx.cache_key = None;
            }

            tracing::warn!(
                agent = %ctx.agent,
                attempt = retry_ctx.attempt,
                model = %retry_ctx.model,
                delay_ms = plan.delay.as_millis() as u64,
                error = %last_error,
                "retrying invocation"
            );
            if !plan.delay.is_zero() {
                tokio::time::sleep(plan.delay).await;
            }

            let result = restart.run(&mut retry_ctx).await;
            match result {
                Ok(()) => {
                    attempts.push(retry_ctx);
                    succeeded = true;
                    break;
                }
                Err(e) => {
                    if retry_ctx.error.is_none() {
                        retry_ctx.error = Some(e.to_info());
                    }
                    last_error = e;
                    attempts.push(retry_ctx);
                }
            }
        }

        let mut chain: Option<Box<ExecutionContext>> = None;
        for mut attempt in attempts.into_iter().rev() {
            attempt.retry = chain;
            chain = Some(Box::new(attempt));
        }
        ctx.retry = chain;

        if succeeded {
            Ok(())
        } else {
            Err(last_error)
        }
    }
}
