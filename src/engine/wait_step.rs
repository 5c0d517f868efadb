use serde_json::{json, Value};
use tokio::time::Instant;

use super::{Control, RunEnv};
use crate::domain::execution::{StepResult, StepScope};
use crate::domain::model::{TimeoutPolicy, WaitDeclaration, WaitKind};
use crate::error::StepError;
use crate::wait::{ApprovalRequest, WaitStatus};

/// Suspends the execution on a delay, a poll or an approval and applies the
/// wait's timeout policy.
pub(crate) async fn run_wait(
    env: &RunEnv,
    wait: &WaitDeclaration,
    scope: &StepScope,
) -> (StepResult, Control) {
    env.step_started(scope, wait.name());
    let started = Instant::now();
    let waits = &env.engine.waits;

    let (result, control) = match wait.kind() {
        WaitKind::Delay(duration) => match waits.delay(*duration, &env.cancel).await {
            Ok(()) => (
                StepResult::success(
                    wait.name(),
                    json!({ "waited_ms": duration.as_millis() as u64 }),
                ),
                Control::Continue,
            ),
            Err(error) => abort(wait.name(), error, Value::Null),
        },
        WaitKind::Until(spec) => {
            let polled = waits
                .poll(&env.execution_id, wait.name(), spec, scope, &env.cancel)
                .await;
            match polled {
                Ok(outcome) => {
                    let content = serde_json::to_value(&outcome).unwrap_or_default();
                    if outcome.satisfied {
                        (StepResult::success(wait.name(), content), Control::Continue)
                    } else {
                        timed_out(wait.name(), spec.on_timeout, content)
                    }
                }
                Err(error) => abort(wait.name(), error, Value::Null),
            }
        }
        WaitKind::Approval(spec) => {
            let request = ApprovalRequest::new(env.execution_id.to_string(), wait.name());
            match waits.request_approval(request, spec, &env.cancel).await {
                Ok(state) => {
                    let content = serde_json::to_value(&state).unwrap_or_default();
                    match state.status {
                        WaitStatus::Approved => {
                            (StepResult::success(wait.name(), content), Control::Continue)
                        }
                        WaitStatus::Rejected => {
                            let reason = state.comment.clone().unwrap_or_else(|| {
                                format!(
                                    "rejected by {}",
                                    state.decided_by.as_deref().unwrap_or("approver")
                                )
                            });
                            abort(wait.name(), StepError::Rejected(reason), content)
                        }
                        // An escalated request that timed out again is final.
                        _ => {
                            let policy = match spec.on_timeout {
                                TimeoutPolicy::Escalate => TimeoutPolicy::Fail,
                                other => other,
                            };
                            timed_out(wait.name(), policy, content)
                        }
                    }
                }
                Err(error) => abort(wait.name(), error, Value::Null),
            }
        }
    };

    let result = result.with_duration_ms(started.elapsed().as_millis() as u64);
    env.step_finished(scope, &result);
    (result, control)
}

fn timed_out(name: &str, policy: TimeoutPolicy, content: Value) -> (StepResult, Control) {
    match policy {
        TimeoutPolicy::Continue => (
            StepResult::success(name, content).with_metadata("timed_out", Value::Bool(true)),
            Control::Continue,
        ),
        TimeoutPolicy::SkipNext => (
            StepResult::success(name, content).with_metadata("timed_out", Value::Bool(true)),
            Control::SkipNext,
        ),
        TimeoutPolicy::Fail | TimeoutPolicy::Escalate => abort(
            name,
            StepError::WaitTimeout(format!("'{}' was not resolved in time", name)),
            content,
        ),
    }
}

fn abort(name: &str, error: StepError, content: Value) -> (StepResult, Control) {
    tracing::error!(step = %name, error = %error, "wait failed");
    (
        StepResult::failed(name, &error, content),
        Control::Abort(error),
    )
}
