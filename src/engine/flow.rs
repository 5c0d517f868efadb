use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::hooks::{HookPoint, Hooks, WorkflowSnapshot};
use super::{parallel, routing, step_executor, wait_step, Control, RunEnv};
use crate::config::EngineConfig;
use crate::core::event_bus::WorkflowEvent;
use crate::core::result_store::ResultStore;
use crate::core::runtime_context::RuntimeContext;
use crate::core::throttle::ThrottleManager;
use crate::domain::execution::{ExecutionResult, StepResult, StepScope, WorkflowStatus};
use crate::domain::model::{FlowNode, WorkflowDefinition};
use crate::error::{ErrorCode, StepError, WorkflowError};
use crate::infrastructure::{Notifier, TracingNotifier};
use crate::wait::WaitCoordinator;

/// Shared state of one engine; every execution holds an `Arc` to it.
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) runtime: RuntimeContext,
    pub(crate) throttle: Arc<ThrottleManager>,
    pub(crate) waits: Arc<WaitCoordinator>,
    pub(crate) hooks: Hooks,
}

/// Executes workflow definitions.
///
/// Cloning is cheap; clones share throttle state, pending approvals and
/// hooks.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl Default for FlowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowEngine {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> FlowEngineBuilder {
        FlowEngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn throttle(&self) -> &Arc<ThrottleManager> {
        &self.inner.throttle
    }

    /// Pending approvals are resolved through the coordinator.
    pub fn waits(&self) -> &Arc<WaitCoordinator> {
        &self.inner.waits
    }

    pub async fn run(
        &self,
        definition: &Arc<WorkflowDefinition>,
        input: Value,
    ) -> ExecutionResult {
        self.run_with_cancel(definition, input, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run); cancelling `cancel` interrupts every
    /// in-flight step and wait of the execution.
    pub async fn run_with_cancel(
        &self,
        definition: &Arc<WorkflowDefinition>,
        input: Value,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let max_depth = definition
            .max_recursion_depth()
            .min(self.inner.config.max_recursion_depth);
        let (result, _) = self
            .inner
            .execute(Arc::clone(definition), input, 0, max_depth, cancel)
            .await;
        result
    }
}

#[derive(Default)]
pub struct FlowEngineBuilder {
    config: EngineConfig,
    runtime: RuntimeContext,
    throttle: Option<Arc<ThrottleManager>>,
    notifier: Option<Arc<dyn Notifier>>,
    hooks: Hooks,
}

impl FlowEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(mut self, runtime: RuntimeContext) -> Self {
        self.runtime = runtime;
        self
    }

    /// Share throttle and rate-limit state with other engines.
    pub fn throttle(mut self, throttle: Arc<ThrottleManager>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> FlowEngine {
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier) as Arc<dyn Notifier>);
        let waits = Arc::new(WaitCoordinator::new(notifier, self.runtime.clone()));
        FlowEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                runtime: self.runtime,
                throttle: self.throttle.unwrap_or_default(),
                waits,
                hooks: self.hooks,
            }),
        }
    }
}

enum Ending {
    Completed,
    Halted(Value),
    Failed { step: Option<String>, error: StepError },
}

/// Accumulated state of one execution instance.
struct ExecutionState {
    results: Arc<ResultStore>,
    total_cost: f64,
    total_tokens: u64,
}

impl ExecutionState {
    fn record(&mut self, result: StepResult) {
        self.total_cost += result.cost;
        self.total_tokens += result.tokens;
        Arc::make_mut(&mut self.results).insert(result);
    }
}

impl EngineInner {
    /// Runs one execution instance. Nested executions go through here as
    /// well, hence the boxed future.
    ///
    /// The second element is the error that ended a failed execution.
    pub(crate) fn execute(
        self: &Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        depth: usize,
        max_depth: usize,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, (ExecutionResult, Option<StepError>)> {
        let engine = Arc::clone(self);
        async move {
            engine
                .execute_inner(definition, input, depth, max_depth, cancel)
                .await
        }
        .boxed()
    }

    async fn execute_inner(
        self: Arc<Self>,
        definition: Arc<WorkflowDefinition>,
        input: Value,
        depth: usize,
        max_depth: usize,
        cancel: CancellationToken,
    ) -> (ExecutionResult, Option<StepError>) {
        let execution_id: Arc<str> = Arc::from(self.runtime.id_generator.next_id());
        let started = Instant::now();
        tracing::info!(
            workflow = %definition.name(),
            execution_id = %execution_id,
            depth,
            "workflow started"
        );
        self.runtime.events.emit(WorkflowEvent::WorkflowStarted {
            execution_id: execution_id.to_string(),
            workflow: definition.name().to_string(),
            depth,
            timestamp: self.runtime.now(),
        });

        let run_cancel = cancel.child_token();
        let env = RunEnv {
            engine: Arc::clone(&self),
            definition: Arc::clone(&definition),
            execution_id: Arc::clone(&execution_id),
            depth,
            max_depth,
            cancel: run_cancel.clone(),
            deadline: None,
        };
        let mut state = ExecutionState {
            results: Arc::new(ResultStore::new()),
            total_cost: 0.0,
            total_tokens: 0,
        };
        self.hooks.fire(HookPoint::BeforeWorkflow, || {
            workflow_snapshot(&env, &state, WorkflowStatus::Running, None)
        });

        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = definition.timeout().map(|after| {
            let token = run_cancel.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(after) => {
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let validated = match definition.input_schema() {
            Some(schema) => schema.validate(&input),
            None => Ok(input),
        };
        let mut ending = match validated {
            Ok(input) => walk(&env, Arc::new(input), &mut state).await,
            Err(e) => Ending::Failed {
                step: None,
                error: StepError::Validation(validation_message(e)),
            },
        };
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let workflow_timeout = definition
            .timeout()
            .filter(|_| timed_out.load(Ordering::SeqCst));
        if let Some(after) = workflow_timeout {
            // Work interrupted by the workflow deadline is reported as timed out,
            // even when an optional step absorbed the interruption.
            let mut interrupted = None;
            for result in Arc::make_mut(&mut state.results).iter_mut() {
                if result.is_failed()
                    && result.error.as_ref().map(|e| e.code) == Some(ErrorCode::Cancelled)
                {
                    result.error = Some(StepError::Timeout(after).to_info());
                    interrupted = Some(result.name.clone());
                }
            }
            ending = match ending {
                Ending::Failed { step, .. } => {
                    let recorded = step
                        .as_ref()
                        .is_some_and(|step| state.results.iter().any(|r| &r.name == step));
                    Ending::Failed {
                        step: if recorded { step } else { interrupted.or(step) },
                        error: StepError::Timeout(after),
                    }
                }
                finished if interrupted.is_none() => finished,
                _ => Ending::Failed {
                    step: interrupted,
                    error: StepError::Timeout(after),
                },
            };
        }

        let (status, output, failure) = match ending {
            Ending::Completed => {
                let output = state
                    .results
                    .last()
                    .map(|r| r.content.clone())
                    .unwrap_or(Value::Null);
                match definition.output_schema().map(|schema| schema.project(&output)) {
                    None => (WorkflowStatus::Success, output, None),
                    Some(Ok(projected)) => (WorkflowStatus::Success, projected, None),
                    Some(Err(e)) => (
                        WorkflowStatus::Failed,
                        Value::Null,
                        Some((None, StepError::Validation(validation_message(e)))),
                    ),
                }
            }
            Ending::Halted(output) => (WorkflowStatus::Halted, output, None),
            Ending::Failed { step, error } => {
                (WorkflowStatus::Failed, Value::Null, Some((step, error)))
            }
        };

        let cause = failure.as_ref().map(|(step, error)| match (workflow_timeout, step) {
            (Some(after), _) => WorkflowError::Timeout(after),
            (None, Some(step)) => WorkflowError::from_step(step, &execution_id, error.clone()),
            (None, None) => match error {
                StepError::Validation(message) => WorkflowError::Validation(message.clone()),
                other => WorkflowError::Failed {
                    step: None,
                    message: other.to_string(),
                },
            },
        });
        let (failed_step, step_error) = match failure {
            Some((step, error)) => (step, Some(error)),
            None => (None, None),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match status {
            WorkflowStatus::Failed => tracing::error!(
                workflow = %definition.name(),
                execution_id = %execution_id,
                failed_step = ?failed_step,
                error = ?step_error.as_ref().map(ToString::to_string),
                duration_ms,
                "workflow failed"
            ),
            _ => tracing::info!(
                workflow = %definition.name(),
                execution_id = %execution_id,
                status = %status,
                duration_ms,
                cost = state.total_cost,
                "workflow finished"
            ),
        }
        self.runtime.events.emit(WorkflowEvent::WorkflowFinished {
            execution_id: execution_id.to_string(),
            workflow: definition.name().to_string(),
            status,
            timestamp: self.runtime.now(),
        });
        self.hooks.fire(HookPoint::AfterWorkflow, || {
            let mut snapshot = workflow_snapshot(&env, &state, status, failed_step.as_deref());
            snapshot.error = step_error.as_ref().map(StepError::to_info);
            snapshot
        });

        let result = ExecutionResult {
            execution_id: execution_id.to_string(),
            workflow: definition.name().to_string(),
            status,
            output,
            failed_step,
            error: step_error.as_ref().map(StepError::to_info),
            trace: Arc::unwrap_or_clone(state.results).into_trace(),
            total_cost: state.total_cost,
            total_tokens: state.total_tokens,
            duration_ms,
            depth,
            cause,
        };
        (result, step_error)
    }
}

/// Runs the declared nodes in order until one halts or aborts.
async fn walk(env: &RunEnv, input: Arc<Value>, state: &mut ExecutionState) -> Ending {
    let definition = Arc::clone(&env.definition);
    let mut skip_next: Option<String> = None;

    for node in definition.nodes() {
        if env.cancel.is_cancelled() {
            return Ending::Failed {
                step: Some(node.name().to_string()),
                error: StepError::Cancelled("execution cancelled".into()),
            };
        }

        let scope = StepScope::new(
            Arc::clone(&input),
            Arc::clone(&state.results),
            Arc::clone(definition.declared_names()),
            Arc::clone(&env.execution_id),
            env.depth,
        );

        if let Some(source) = skip_next.take() {
            let reason = format!("skipped after '{}' timed out", source);
            let result = StepResult::skipped(node.name(), None, &reason);
            env.step_finished(&scope, &result);
            drop(scope);
            state.record(result);
            continue;
        }

        let (results, control) = match node {
            FlowNode::Step(step) => {
                let (result, control) = step_executor::execute_step(env, step, &scope).await;
                (vec![result], control)
            }
            other if !other.guard().allows(&scope) => {
                let result = StepResult::skipped(other.name(), None, "guard");
                env.step_finished(&scope, &result);
                (vec![result], Control::Continue)
            }
            FlowNode::Route(route) => {
                let (result, control) = routing::run_route(env, route, &scope).await;
                (vec![result], control)
            }
            FlowNode::Parallel(group) => {
                env.fire(HookPoint::BeforeStep, &scope, group.name());
                env.step_started(&scope, group.name());
                let outcome = parallel::run_group(env, group, &scope).await;
                if let Some(summary) = outcome.results.last() {
                    env.step_finished(&scope, summary);
                }
                (outcome.results, outcome.control)
            }
            FlowNode::Wait(wait) => {
                env.fire(HookPoint::BeforeStep, &scope, wait.name());
                let (result, control) = wait_step::run_wait(env, wait, &scope).await;
                (vec![result], control)
            }
        };
        drop(scope);

        for result in results {
            state.record(result);
        }

        if let Some(ceiling) = definition.max_cost() {
            if state.total_cost > ceiling {
                return Ending::Failed {
                    step: Some(node.name().to_string()),
                    error: StepError::BudgetExceeded(format!(
                        "workflow cost {:.4} exceeds ceiling {:.4}",
                        state.total_cost, ceiling
                    )),
                };
            }
        }

        match control {
            Control::Continue => {}
            Control::SkipNext => skip_next = Some(node.name().to_string()),
            Control::Halt(output) => {
                tracing::info!(
                    execution_id = %env.execution_id,
                    step = %node.name(),
                    "workflow halted"
                );
                return Ending::Halted(output);
            }
            Control::Abort(error) => {
                return Ending::Failed {
                    step: Some(node.name().to_string()),
                    error,
                }
            }
        }
    }

    Ending::Completed
}

fn workflow_snapshot(
    env: &RunEnv,
    state: &ExecutionState,
    status: WorkflowStatus,
    step: Option<&str>,
) -> WorkflowSnapshot {
    WorkflowSnapshot {
        workflow: env.definition.name().to_string(),
        execution_id: env.execution_id.to_string(),
        depth: env.depth,
        status,
        step: step.map(str::to_string),
        result: step.and_then(|name| state.results.get(name).cloned()),
        error: None,
        results: Arc::clone(&state.results),
    }
}

fn validation_message(error: WorkflowError) -> String {
    match error {
        WorkflowError::Validation(message) => message,
        other => other.to_string(),
    }
}
