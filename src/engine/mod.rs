//! Engine layer: walks a workflow definition and executes its flow nodes.
//!
//! [`FlowEngine`] owns the shared throttle state, the wait coordinator and
//! the lifecycle hooks. Every node kind lives in its own module; they share
//! the per-execution [`RunEnv`] and report back through [`Control`].

mod flow;
mod hooks;
mod iteration;
mod parallel;
mod routing;
mod step_executor;
mod wait_step;

pub use flow::{FlowEngine, FlowEngineBuilder};
pub use hooks::{Hook, HookPoint, Hooks, WorkflowSnapshot};

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::event_bus::WorkflowEvent;
use crate::domain::execution::{StepResult, StepScope, StepStatus, WorkflowStatus};
use crate::domain::model::WorkflowDefinition;
use crate::error::StepError;
use flow::EngineInner;

/// What the flow loop does after a node settled.
#[derive(Debug)]
pub(crate) enum Control {
    Continue,
    /// Record the next declared node as skipped without running it.
    SkipNext,
    Halt(Value),
    Abort(StepError),
}

/// Everything a node needs from its execution instance. Cheap to clone so
/// concurrent branches can own a copy.
#[derive(Clone)]
pub(crate) struct RunEnv {
    pub(crate) engine: Arc<EngineInner>,
    pub(crate) definition: Arc<WorkflowDefinition>,
    pub(crate) execution_id: Arc<str>,
    pub(crate) depth: usize,
    pub(crate) max_depth: usize,
    pub(crate) cancel: CancellationToken,
    /// Deadline of the innermost parallel group, with its configured length.
    pub(crate) deadline: Option<(Instant, Duration)>,
}

impl RunEnv {
    /// Same execution with a narrower cancellation scope.
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        let mut env = self.clone();
        env.cancel = cancel;
        env
    }

    /// Same execution bounded by a group deadline. An earlier inherited
    /// deadline stays in force.
    pub(crate) fn with_deadline(mut self, at: Instant, after: Duration) -> Self {
        if self.deadline.map_or(true, |(current, _)| at < current) {
            self.deadline = Some((at, after));
        }
        self
    }

    /// What an attempt cut short by cancellation failed with: a timeout once
    /// the group deadline has passed, a plain cancellation otherwise.
    pub(crate) fn interruption(&self, step: &str) -> StepError {
        match self.deadline {
            Some((at, after)) if Instant::now() >= at => StepError::Timeout(after),
            _ => StepError::Cancelled(format!("step '{}' interrupted", step)),
        }
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.engine.config.default_step_timeout()
    }

    pub(crate) fn emit(&self, event: WorkflowEvent) {
        self.engine.runtime.events.emit(event);
    }

    pub(crate) fn snapshot(
        &self,
        scope: &StepScope,
        step: &str,
        result: Option<&StepResult>,
    ) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow: self.definition.name().to_string(),
            execution_id: self.execution_id.to_string(),
            depth: self.depth,
            status: WorkflowStatus::Running,
            step: Some(step.to_string()),
            result: result.cloned(),
            error: result.and_then(|r| r.error.clone()),
            results: Arc::new(scope.results().clone()),
        }
    }

    pub(crate) fn fire(&self, point: HookPoint, scope: &StepScope, step: &str) {
        self.engine
            .hooks
            .fire(point, || self.snapshot(scope, step, None));
    }

    pub(crate) fn step_started(&self, scope: &StepScope, step: &str) {
        self.fire(HookPoint::OnStepStart, scope, step);
        self.emit(WorkflowEvent::StepStarted {
            execution_id: self.execution_id.to_string(),
            step: step.to_string(),
            timestamp: self.engine.runtime.now(),
        });
    }

    /// Fires the completion hooks and publishes the finished event.
    pub(crate) fn step_finished(&self, scope: &StepScope, result: &StepResult) {
        let point = match result.status {
            StepStatus::Failed => HookPoint::OnStepFailure,
            _ => HookPoint::OnStepComplete,
        };
        let hooks = &self.engine.hooks;
        hooks.fire(point, || self.snapshot(scope, &result.name, Some(result)));
        hooks.fire(HookPoint::AfterStep, || {
            self.snapshot(scope, &result.name, Some(result))
        });

        tracing::debug!(
            execution_id = %self.execution_id,
            step = %result.name,
            status = %result.status,
            attempts = result.attempts,
            duration_ms = result.duration_ms,
            "step finished"
        );
        self.emit(WorkflowEvent::StepFinished {
            execution_id: self.execution_id.to_string(),
            step: result.name.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
        });
    }
}
