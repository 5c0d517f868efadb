//! Lifecycle hooks.
//!
//! Hooks observe an execution; they never steer it. Each callback receives a
//! read-only [`WorkflowSnapshot`], and errors or panics raised by a hook are
//! logged and swallowed.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::core::result_store::ResultStore;
use crate::domain::execution::{StepResult, WorkflowStatus};
use crate::error::ErrorInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeWorkflow,
    /// Before the step's guard is evaluated.
    BeforeStep,
    /// The step passed its guard and is about to run.
    OnStepStart,
    /// The step finished with `success` or `skipped`.
    OnStepComplete,
    /// One attempt of the step failed; fires again for every retry.
    OnStepError,
    /// The step's final status is `failed`.
    OnStepFailure,
    /// After the step's result is settled, whatever its status.
    AfterStep,
    AfterWorkflow,
}

/// State handed to a hook.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub workflow: String,
    pub execution_id: String,
    pub depth: usize,
    pub status: WorkflowStatus,
    pub step: Option<String>,
    /// The step's result, for hooks that fire after it settled.
    pub result: Option<StepResult>,
    pub error: Option<ErrorInfo>,
    pub results: Arc<ResultStore>,
}

impl WorkflowSnapshot {
    pub fn output(&self, step: &str) -> Option<&serde_json::Value> {
        self.results.get(step).map(|r| &r.content)
    }
}

pub type Hook = Arc<dyn Fn(&WorkflowSnapshot) -> Result<(), String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Hooks {
    registered: HashMap<HookPoint, Vec<Hook>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: Fn(&WorkflowSnapshot) -> Result<(), String> + Send + Sync + 'static,
    {
        self.registered.entry(point).or_default().push(Arc::new(hook));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.registered.values().all(Vec::is_empty)
    }

    /// Runs every hook for `point`. The snapshot is built lazily so
    /// executions without hooks pay nothing.
    pub(crate) fn fire<F>(&self, point: HookPoint, snapshot: F)
    where
        F: FnOnce() -> WorkflowSnapshot,
    {
        let Some(hooks) = self.registered.get(&point).filter(|h| !h.is_empty()) else {
            return;
        };
        let snapshot = snapshot();
        for hook in hooks {
            match catch_unwind(AssertUnwindSafe(|| hook(&snapshot))) {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    tracing::warn!(
                        hook = ?point,
                        execution_id = %snapshot.execution_id,
                        step = ?snapshot.step,
                        error = %message,
                        "hook failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        hook = ?point,
                        execution_id = %snapshot.execution_id,
                        step = ?snapshot.step,
                        "hook panicked"
                    );
                }
            }
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&HookPoint, usize> =
            self.registered.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("Hooks").field("registered", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow: "review".into(),
            execution_id: "exec-1".into(),
            depth: 0,
            status: WorkflowStatus::Running,
            step: Some("extract".into()),
            result: None,
            error: None,
            results: Arc::new(ResultStore::new()),
        }
    }

    #[test]
    fn test_failing_and_panicking_hooks_are_absorbed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hooks = Hooks::new()
            .on(HookPoint::BeforeStep, |_| Err("boom".into()))
            .on(HookPoint::BeforeStep, |_| panic!("hook bug"))
            .on(HookPoint::BeforeStep, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });

        hooks.fire(HookPoint::BeforeStep, snapshot);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_snapshot_built_only_when_hooks_exist() {
        let hooks = Hooks::new();
        assert!(hooks.is_empty());
        hooks.fire(HookPoint::AfterWorkflow, || unreachable!("no hooks registered"));
    }
}
