use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::step_executor::execute_step;
use super::{Control, RunEnv};
use crate::domain::execution::{StepResult, StepScope};
use crate::domain::model::ParallelGroup;
use crate::error::StepError;

/// Results of a parallel group: every member in declaration order, then the
/// group's own entry.
pub(crate) struct GroupOutcome {
    pub(crate) results: Vec<StepResult>,
    pub(crate) control: Control,
}

/// Runs the members of `group` concurrently against the same snapshot.
///
/// Each member writes only its own slot. Under `fail_fast` the first
/// critical failure cancels the siblings still running; a group timeout
/// cancels whatever is still running and those members settle as timed out.
/// Interrupted members still report through the step hooks and events.
pub(crate) async fn run_group(
    env: &RunEnv,
    group: &ParallelGroup,
    scope: &StepScope,
) -> GroupOutcome {
    let started = Instant::now();
    let members = group.members();
    let limit = group
        .concurrency()
        .unwrap_or(members.len())
        .min(env.engine.config.max_parallelism)
        .max(1);
    tracing::debug!(
        execution_id = %env.execution_id,
        group = %group.name(),
        members = members.len(),
        concurrency = limit,
        "running parallel group"
    );

    let cancel = env.cancel.child_token();
    let mut member_env = env.with_cancel(cancel.clone());
    if let Some(after) = group.timeout() {
        member_env = member_env.with_deadline(started + after, after);
    }
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut join_set = JoinSet::new();
    for (index, member) in members.iter().enumerate() {
        let env = member_env.clone();
        let member = member.clone();
        let scope = scope.clone();
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let (result, control) = execute_step(&env, &member, &scope).await;
            (index, result, control)
        });
    }

    let deadline = group.timeout().map(|after| started + after);
    let mut slots: Vec<Option<StepResult>> = (0..members.len()).map(|_| None).collect();
    let mut abort: Option<(usize, StepError)> = None;
    let mut halt: Option<(usize, Value)> = None;
    let mut timed_out = false;

    loop {
        let joined = match deadline {
            Some(at) => tokio::select! {
                joined = join_set.join_next() => joined,
                _ = tokio::time::sleep_until(at) => {
                    timed_out = true;
                    None
                }
            },
            None => join_set.join_next().await,
        };
        let Some(joined) = joined else { break };
        let (index, result, control) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(group = %group.name(), error = %e, "parallel member task aborted");
                continue;
            }
        };
        slots[index] = Some(result);
        match control {
            Control::Abort(error) => {
                let replace = match &abort {
                    None => true,
                    Some((i, _)) => !group.is_fail_fast() && index < *i,
                };
                if replace {
                    abort = Some((index, error));
                }
                if group.is_fail_fast() {
                    break;
                }
            }
            Control::Halt(output) => {
                if halt.as_ref().map_or(true, |(i, _)| index < *i) {
                    halt = Some((index, output));
                }
            }
            Control::Continue | Control::SkipNext => {}
        }
    }

    if !join_set.is_empty() {
        cancel.cancel();
        let mut late_abort: Option<(usize, StepError)> = None;
        while let Some(joined) = join_set.join_next().await {
            let (index, result, control) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(group = %group.name(), error = %e, "parallel member task aborted");
                    continue;
                }
            };
            slots[index] = Some(result);
            if let Control::Abort(error) = control {
                if late_abort.as_ref().map_or(true, |(i, _)| index < *i) {
                    late_abort = Some((index, error));
                }
            }
        }
        // A fail-fast abort keeps the failure that triggered the cancellation.
        if abort.is_none() {
            abort = late_abort;
        }
    }

    let mut results = Vec::with_capacity(members.len() + 1);
    for (index, slot) in slots.into_iter().enumerate() {
        let result = match slot {
            Some(result) => result,
            // Only a member whose task died leaves its slot empty.
            None => {
                let member = &members[index];
                let error = match (timed_out, group.timeout()) {
                    (true, Some(after)) => StepError::Timeout(after),
                    _ => StepError::Cancelled(format!(
                        "cancelled after a sibling in '{}' failed",
                        group.name()
                    )),
                };
                if timed_out && member.is_critical() && abort.is_none() {
                    abort = Some((index, error.clone()));
                }
                let content = member.default_value().cloned().unwrap_or(Value::Null);
                StepResult::failed(member.name(), &error, content)
            }
        };
        results.push(result);
    }

    let mut content = Map::new();
    for result in &results {
        content.insert(result.name.clone(), result.content.clone());
    }

    let (mut summary, control) = match (abort, halt) {
        (Some((_, error)), _) => (
            StepResult::failed(group.name(), &error, Value::Object(content)),
            Control::Abort(error),
        ),
        (None, Some((_, output))) => (
            StepResult::halted(group.name(), output.clone()),
            Control::Halt(output),
        ),
        (None, None) => (
            StepResult::success(group.name(), Value::Object(content)),
            Control::Continue,
        ),
    };
    // Cost and tokens stay on the member entries.
    summary.duration_ms = started.elapsed().as_millis() as u64;
    if timed_out {
        summary = summary.with_metadata("timed_out", Value::Bool(true));
    }

    tracing::debug!(
        execution_id = %env.execution_id,
        group = %group.name(),
        status = %summary.status,
        duration_ms = summary.duration_ms,
        "parallel group finished"
    );
    results.push(summary);
    GroupOutcome { results, control }
}
