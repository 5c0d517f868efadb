use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::step_executor::{run_attempts, settle, Attempted, Resolution};
use super::{Control, RunEnv};
use crate::domain::execution::{ItemResult, IterationResults, StepResult, StepScope, StepStatus};
use crate::domain::model::{IterationSpec, StepDeclaration};
use crate::error::StepError;
use crate::units::Usage;

/// Accumulates item outcomes in item order, whatever order they finish in.
struct Collector {
    slots: Vec<Option<ItemResult>>,
    usage: Usage,
    failure: Option<(usize, StepError)>,
    halt: Option<(usize, Value)>,
    fail_fast: bool,
}

impl Collector {
    fn new(total: usize, fail_fast: bool) -> Self {
        Self {
            slots: (0..total).map(|_| None).collect(),
            usage: Usage::default(),
            failure: None,
            halt: None,
            fail_fast,
        }
    }

    /// Returns true when the remaining items should be cancelled.
    fn record(&mut self, index: usize, attempted: Attempted) -> bool {
        self.usage.add(&attempted.usage);
        let attempts = attempted.attempts;
        let mut stop = false;
        let item = match attempted.resolution {
            Resolution::Done(content) => ItemResult::new(index, StepStatus::Success, content),
            Resolution::Skipped { default, .. } => {
                ItemResult::new(index, StepStatus::Skipped, default.unwrap_or(Value::Null))
            }
            Resolution::Halted(output) => {
                if self.halt.as_ref().map_or(true, |(i, _)| index < *i) {
                    self.halt = Some((index, output.clone()));
                }
                stop = true;
                ItemResult::new(index, StepStatus::Halted, output)
            }
            Resolution::Failed { error, .. } => {
                let info = error.to_info();
                // Under fail-fast the trigger is the first failure to arrive;
                // otherwise report the lowest failing index.
                let replace = match &self.failure {
                    None => true,
                    Some((i, _)) => !self.fail_fast && index < *i,
                };
                if replace {
                    self.failure = Some((index, error));
                }
                stop = self.fail_fast;
                let mut item = ItemResult::new(index, StepStatus::Failed, Value::Null);
                item.error = Some(info);
                item
            }
        };
        self.slots[index] = Some(ItemResult { attempts, ..item });
        stop
    }

    fn finish(self) -> (IterationResults, Usage, Option<(usize, StepError)>, Option<Value>) {
        let items = self
            .slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let mut item = ItemResult::new(index, StepStatus::Failed, Value::Null);
                    item.error = Some(
                        StepError::Cancelled("iteration stopped before this item ran".into())
                            .to_info(),
                    );
                    item
                })
            })
            .collect();
        (
            IterationResults::from_items(items),
            self.usage,
            self.failure,
            self.halt.map(|(_, output)| output),
        )
    }
}

/// Runs the step body once per item of the iteration source.
///
/// With `concurrency == 1` items run one after another on the current task;
/// otherwise they are spawned on a `JoinSet` bounded by a semaphore.
pub(crate) async fn run_iteration(
    env: &RunEnv,
    decl: &StepDeclaration,
    spec: &IterationSpec,
    scope: &StepScope,
) -> (StepResult, Control) {
    let items = match (spec.source)(scope) {
        Ok(items) => items,
        Err(error) => return settle(env, decl, Attempted::failed(error)),
    };
    let total = items.len();
    let limit = spec.concurrency.min(env.engine.config.max_parallelism).max(1);
    tracing::debug!(
        execution_id = %env.execution_id,
        step = %decl.name(),
        items = total,
        concurrency = limit,
        "iterating"
    );

    let mut collector = Collector::new(total, spec.fail_fast);
    let cancel = env.cancel.child_token();
    let item_env = env.with_cancel(cancel.clone());

    if limit == 1 {
        for (index, item) in items.into_iter().enumerate() {
            let item_scope = scope.with_item(item, index);
            let attempted = run_attempts(&item_env, decl, &item_scope).await;
            if collector.record(index, attempted) {
                break;
            }
        }
    } else {
        let semaphore = Arc::new(Semaphore::new(limit));
        let decl = Arc::new(decl.clone());
        let mut join_set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            let env = item_env.clone();
            let decl = Arc::clone(&decl);
            let semaphore = Arc::clone(&semaphore);
            let item_scope = scope.with_item(item, index);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                if env.cancel.is_cancelled() {
                    return (index, None);
                }
                (index, Some(run_attempts(&env, &decl, &item_scope).await))
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Some(attempted))) => {
                    if collector.record(index, attempted) {
                        cancel.cancel();
                    }
                }
                Ok((_, None)) => {}
                Err(e) => {
                    tracing::warn!(step = %decl.name(), error = %e, "iteration task aborted");
                }
            }
        }
    }

    let (iteration, usage, failure, halt) = collector.finish();
    let attempts = iteration.items.iter().map(|item| item.attempts).sum();
    tracing::debug!(
        execution_id = %env.execution_id,
        step = %decl.name(),
        successful = iteration.successful_count,
        failed = iteration.failed_count,
        "iteration finished"
    );

    let resolution = match (halt, failure) {
        (Some(output), _) => Resolution::Halted(output),
        (None, Some((index, error))) if !spec.continue_on_error => Resolution::Failed {
            error: StepError::Iteration {
                index,
                source: Box::new(error),
            },
            deliberate: false,
        },
        _ => Resolution::Done(Value::Array(iteration.contents())),
    };

    let (mut result, control) = settle(
        env,
        decl,
        Attempted {
            resolution,
            attempts,
            usage,
            sub_trace: None,
            fallback: None,
        },
    );
    result.iteration = Some(iteration);
    (result, control)
}
