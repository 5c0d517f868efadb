//! Runs one step declaration: guard, input, throttling, timeout, retries,
//! fallbacks and flow-control signals.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::hooks::HookPoint;
use super::{iteration, Control, RunEnv};
use crate::core::event_bus::WorkflowEvent;
use crate::domain::execution::{StepOutcome, StepResult, StepScope};
use crate::domain::model::{StepDeclaration, StepTarget, WorkflowDefinition};
use crate::error::StepError;
use crate::units::Usage;

/// Final state of a step's attempts before optional/critical handling.
#[derive(Debug)]
pub(crate) enum Resolution {
    Done(Value),
    Skipped {
        reason: String,
        default: Option<Value>,
    },
    Halted(Value),
    /// `deliberate` marks a `fail!` from the step itself, which is never
    /// absorbed by `optional`.
    Failed { error: StepError, deliberate: bool },
}

#[derive(Debug)]
pub(crate) struct Attempted {
    pub(crate) resolution: Resolution,
    pub(crate) attempts: u32,
    pub(crate) usage: Usage,
    pub(crate) sub_trace: Option<Vec<StepResult>>,
    pub(crate) fallback: Option<String>,
}

impl Attempted {
    pub(crate) fn failed(error: StepError) -> Self {
        Self {
            resolution: Resolution::Failed {
                error,
                deliberate: false,
            },
            attempts: 0,
            usage: Usage::default(),
            sub_trace: None,
            fallback: None,
        }
    }
}

struct Invoked {
    outcome: StepOutcome,
    usage: Usage,
    sub_trace: Option<Vec<StepResult>>,
}

/// Runs `decl` against the current scope and settles its result.
pub(crate) async fn execute_step(
    env: &RunEnv,
    decl: &StepDeclaration,
    scope: &StepScope,
) -> (StepResult, Control) {
    env.fire(HookPoint::BeforeStep, scope, decl.name());
    if !decl.guard.allows(scope) {
        let result = StepResult::skipped(decl.name(), decl.default.clone(), "guard");
        env.step_finished(scope, &result);
        return (result, Control::Continue);
    }

    env.step_started(scope, decl.name());
    let started = Instant::now();
    let (mut result, control) = match &decl.each {
        Some(spec) => iteration::run_iteration(env, decl, spec, scope).await,
        None => {
            let attempted = run_attempts(env, decl, scope).await;
            settle(env, decl, attempted)
        }
    };
    result.duration_ms = started.elapsed().as_millis() as u64;
    env.step_finished(scope, &result);
    (result, control)
}

/// Turns the attempts of a step into its recorded result, applying the
/// `optional` default and the `critical` flag to failures.
pub(crate) fn settle(
    env: &RunEnv,
    decl: &StepDeclaration,
    attempted: Attempted,
) -> (StepResult, Control) {
    let Attempted {
        resolution,
        attempts,
        usage,
        sub_trace,
        fallback,
    } = attempted;

    let name = decl.name();
    let (mut result, control) = match resolution {
        Resolution::Done(content) => (StepResult::success(name, content), Control::Continue),
        Resolution::Skipped { reason, default } => (
            StepResult::skipped(name, default.or_else(|| decl.default.clone()), &reason),
            Control::Continue,
        ),
        Resolution::Halted(output) => (
            StepResult::halted(name, output.clone()),
            Control::Halt(output),
        ),
        Resolution::Failed { error, deliberate } => {
            let absorbable = !deliberate
                && !matches!(
                    error.root_cause(),
                    StepError::RecursionLimitExceeded { .. }
                );
            if absorbable && (decl.optional || !decl.critical) {
                tracing::warn!(
                    execution_id = %env.execution_id,
                    step = %name,
                    error = %error,
                    optional = decl.optional,
                    "step failed; continuing"
                );
                let content = decl.default.clone().unwrap_or(Value::Null);
                (StepResult::failed(name, &error, content), Control::Continue)
            } else {
                tracing::error!(
                    execution_id = %env.execution_id,
                    workflow = %env.definition.name(),
                    step = %name,
                    error = %error,
                    "critical step failed"
                );
                (
                    StepResult::failed(name, &error, Value::Null),
                    Control::Abort(error),
                )
            }
        }
    };

    result = result.with_attempts(attempts).with_usage(&usage);
    result.sub_trace = sub_trace;
    if let Some(label) = fallback {
        result = result.with_metadata("fallback", Value::String(label));
    }
    (result, control)
}

/// Primary target with retries, then each fallback once.
pub(crate) async fn run_attempts(
    env: &RunEnv,
    decl: &StepDeclaration,
    scope: &StepScope,
) -> Attempted {
    let policy = &decl.retry;
    let max_attempts = policy.max_retries.saturating_add(1);
    let timeout = decl.timeout.or_else(|| env.default_timeout());

    let mut attempted = Attempted::failed(StepError::Failed("step never ran".into()));

    let mut last_error = loop {
        attempted.attempts += 1;
        let attempt = attempted.attempts;

        let (error, retryable) = match invoke_once(env, decl, &decl.target, scope, timeout).await {
            Ok(invoked) => {
                attempted.usage.add(&invoked.usage);
                if invoked.sub_trace.is_some() {
                    attempted.sub_trace = invoked.sub_trace;
                }
                match invoked.outcome {
                    StepOutcome::RetryRequested(reason) => {
                        (StepError::Failed(format!("retry requested: {}", reason)), true)
                    }
                    outcome => {
                        attempted.resolution = resolve(outcome);
                        return attempted;
                    }
                }
            }
            Err(error) => {
                if let StepError::SubWorkflow { trace, .. } = &error {
                    attempted.sub_trace = Some(trace.as_ref().clone());
                }
                let retryable = policy.should_retry(&error);
                (error, retryable)
            }
        };

        report_error(env, decl, scope, &error, attempt);
        if !retryable || attempt >= max_attempts || env.cancel.is_cancelled() {
            break error;
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            execution_id = %env.execution_id,
            step = %decl.name(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying step"
        );
        env.emit(WorkflowEvent::StepRetry {
            execution_id: env.execution_id.to_string(),
            step: decl.name().to_string(),
            attempt: attempt + 1,
            error: error.to_string(),
        });
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = env.cancel.cancelled() => break error,
            }
        }
    };

    if !last_error.is_terminal() {
        for target in &decl.fallbacks {
            if env.cancel.is_cancelled() {
                break;
            }
            attempted.attempts += 1;
            tracing::info!(
                execution_id = %env.execution_id,
                step = %decl.name(),
                fallback = %target.label(),
                "trying fallback"
            );
            match invoke_once(env, decl, target, scope, timeout).await {
                Ok(invoked) => {
                    attempted.usage.add(&invoked.usage);
                    match invoked.outcome {
                        StepOutcome::RetryRequested(reason) => {
                            last_error = StepError::Failed(format!("retry requested: {}", reason));
                            report_error(env, decl, scope, &last_error, attempted.attempts);
                        }
                        outcome => {
                            if invoked.sub_trace.is_some() {
                                attempted.sub_trace = invoked.sub_trace;
                            }
                            attempted.fallback = Some(target.label());
                            attempted.resolution = resolve(outcome);
                            return attempted;
                        }
                    }
                }
                Err(error) => {
                    report_error(env, decl, scope, &error, attempted.attempts);
                    let terminal = error.is_terminal();
                    last_error = error;
                    if terminal {
                        break;
                    }
                }
            }
        }
    }

    attempted.resolution = Resolution::Failed {
        error: last_error,
        deliberate: false,
    };
    attempted
}

fn resolve(outcome: StepOutcome) -> Resolution {
    match outcome {
        StepOutcome::Continue(content) => Resolution::Done(content),
        StepOutcome::Skip { reason, default } => Resolution::Skipped { reason, default },
        StepOutcome::Halt(output) => Resolution::Halted(output),
        StepOutcome::Fail(message) => Resolution::Failed {
            error: StepError::Failed(message),
            deliberate: true,
        },
        // Callers intercept retry requests before resolving.
        StepOutcome::RetryRequested(reason) => Resolution::Failed {
            error: StepError::Failed(format!("retry requested: {}", reason)),
            deliberate: false,
        },
    }
}

fn report_error(
    env: &RunEnv,
    decl: &StepDeclaration,
    scope: &StepScope,
    error: &StepError,
    attempt: u32,
) {
    tracing::debug!(
        execution_id = %env.execution_id,
        step = %decl.name(),
        attempt,
        error = %error,
        "step attempt failed"
    );
    env.engine.hooks.fire(HookPoint::OnStepError, || {
        let mut snapshot = env.snapshot(scope, decl.name(), None);
        snapshot.error = Some(error.to_info());
        snapshot
    });
}

/// One attempt. Cancellation of the execution interrupts every stage,
/// throttling included.
async fn invoke_once(
    env: &RunEnv,
    decl: &StepDeclaration,
    target: &StepTarget,
    scope: &StepScope,
    timeout: Option<Duration>,
) -> Result<Invoked, StepError> {
    tokio::select! {
        biased;
        _ = env.cancel.cancelled() => Err(env.interruption(decl.name())),
        result = attempt_target(env, decl, target, scope, timeout) => result,
    }
}

/// Fresh input, throttling, then the target under the timeout.
async fn attempt_target(
    env: &RunEnv,
    decl: &StepDeclaration,
    target: &StepTarget,
    scope: &StepScope,
    timeout: Option<Duration>,
) -> Result<Invoked, StepError> {
    let input = decl.resolve_input(scope)?;

    let key = format!("{}/{}", env.definition.name(), decl.name());
    if let Some(interval) = decl.throttle {
        env.engine.throttle.throttle(&key, interval).await;
    }
    if let Some(limit) = decl.rate_limit {
        env.engine
            .throttle
            .rate_limit(&key, limit.calls, limit.per())
            .await;
    }

    let call = invoke_target(env, target, scope, input);
    match timeout {
        Some(after) => tokio::time::timeout(after, call)
            .await
            .unwrap_or(Err(StepError::Timeout(after))),
        None => call.await,
    }
}

async fn invoke_target(
    env: &RunEnv,
    target: &StepTarget,
    scope: &StepScope,
    input: Value,
) -> Result<Invoked, StepError> {
    match target {
        StepTarget::Unit(unit) => {
            let output = unit.execute(input).await?;
            Ok(Invoked {
                outcome: StepOutcome::Continue(output.content),
                usage: output.usage,
                sub_trace: None,
            })
        }
        StepTarget::Block(block) => Ok(Invoked {
            outcome: block.run(scope, input).await?,
            usage: Usage::default(),
            sub_trace: None,
        }),
        StepTarget::Workflow(definition) => run_nested(env, Arc::clone(definition), input).await,
        StepTarget::Recurse => run_nested(env, Arc::clone(&env.definition), input).await,
    }
}

/// Nested execution one level deeper. The depth check happens before the
/// nested instance is created.
///
/// The nested definition's own limit applies on top of the inherited one,
/// so a limit can only tighten on the way down.
async fn run_nested(
    env: &RunEnv,
    definition: Arc<WorkflowDefinition>,
    input: Value,
) -> Result<Invoked, StepError> {
    let depth = env.depth + 1;
    let max_depth = env.max_depth.min(definition.max_recursion_depth());
    if depth > max_depth {
        return Err(StepError::RecursionLimitExceeded {
            depth,
            max: max_depth,
        });
    }

    let (result, error) = env
        .engine
        .execute(definition, input, depth, max_depth, env.cancel.child_token())
        .await;

    match error {
        None => Ok(Invoked {
            // A halt inside the nested run ends only the nested run.
            outcome: StepOutcome::Continue(result.output),
            usage: Usage::new(result.total_tokens, 0, result.total_cost),
            sub_trace: Some(result.trace),
        }),
        Some(source) => Err(StepError::SubWorkflow {
            workflow: result.workflow,
            step: result.failed_step,
            source: Box::new(source),
            trace: Arc::new(result.trace),
        }),
    }
}
