use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::WaitCoordinator;
use crate::domain::execution::StepScope;
use crate::domain::model::{PollCondition, PollSpec, TimeoutPolicy};
use crate::error::StepError;
use crate::infrastructure::{Notification, NotificationKind};

/// How a conditional wait ended. A timed-out poll is not an error here; the
/// caller applies the wait's timeout policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    pub satisfied: bool,
    pub checks: u32,
    pub waited_ms: u64,
    pub escalated: bool,
}

impl WaitCoordinator {
    /// Re-evaluates the condition until it holds or the window closes.
    ///
    /// The interval grows by `backoff` after every miss, capped at
    /// `max_interval`, and sleeps never overshoot the deadline.
    pub async fn poll(
        &self,
        execution_id: &str,
        step: &str,
        spec: &PollSpec,
        scope: &StepScope,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, StepError> {
        let started = Instant::now();
        let mut deadline = started + spec.timeout;
        let mut interval = spec.poll_interval;
        let mut outcome = PollOutcome {
            satisfied: false,
            checks: 0,
            waited_ms: 0,
            escalated: false,
        };

        loop {
            outcome.checks += 1;
            if self.condition_holds(&spec.condition, scope) {
                outcome.satisfied = true;
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                match (&spec.on_timeout, &spec.escalate_to) {
                    (TimeoutPolicy::Escalate, Some(target)) if !outcome.escalated => {
                        outcome.escalated = true;
                        tracing::warn!(
                            execution_id = %execution_id,
                            step = %step,
                            escalate_to = %target,
                            "condition not met in time; escalating"
                        );
                        let notification = Notification {
                            kind: NotificationKind::Escalated,
                            request_id: self.runtime.id_generator.next_id(),
                            execution_id: execution_id.to_string(),
                            step: step.to_string(),
                            recipients: vec![target.clone()],
                            message: format!(
                                "Condition for step '{}' not met within {:?}",
                                step, spec.timeout
                            ),
                        };
                        self.send(&[], notification).await;
                        deadline = now + spec.timeout;
                        interval = spec.poll_interval;
                        continue;
                    }
                    _ => break,
                }
            }

            let sleep_for = interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = cancel.cancelled() => {
                    return Err(StepError::Cancelled("poll interrupted".into()));
                }
            }
            interval = next_interval(interval, spec.backoff, spec.max_interval);
        }

        outcome.waited_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            execution_id = %execution_id,
            step = %step,
            satisfied = outcome.satisfied,
            checks = outcome.checks,
            "poll finished"
        );
        Ok(outcome)
    }

    fn condition_holds(&self, condition: &PollCondition, scope: &StepScope) -> bool {
        match condition {
            PollCondition::Predicate(predicate) => predicate(scope),
            PollCondition::At(when) => self.runtime.now() >= *when,
        }
    }
}

fn next_interval(current: Duration, factor: f64, max: Duration) -> Duration {
    let grown = current.as_secs_f64() * factor;
    if !grown.is_finite() || grown >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(grown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::result_store::ResultStore;
    use crate::infrastructure::InMemoryNotifier;
    use crate::core::runtime_context::RuntimeContext;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn scope() -> StepScope {
        StepScope::new(
            Arc::new(json!({})),
            Arc::new(ResultStore::new()),
            Arc::new(HashSet::new()),
            Arc::from("exec-1"),
            0,
        )
    }

    #[test]
    fn test_next_interval_caps() {
        let max = Duration::from_secs(10);
        assert_eq!(next_interval(Duration::from_secs(2), 2.0, max), Duration::from_secs(4));
        assert_eq!(next_interval(Duration::from_secs(8), 2.0, max), max);
        assert_eq!(next_interval(Duration::from_secs(3), 1.0, max), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_condition_holds() {
        let coordinator = WaitCoordinator::default();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let spec = PollSpec::predicate(
            move |_| counter.fetch_add(1, Ordering::SeqCst) >= 3,
            Duration::from_secs(60),
        )
        .poll_interval(Duration::from_secs(1))
        .backoff(2.0, Duration::from_secs(30));

        let outcome = coordinator
            .poll("exec-1", "ready", &spec, &scope(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.satisfied);
        assert_eq!(outcome.checks, 4);
        // 1s + 2s + 4s between the four checks.
        assert_eq!(outcome.waited_ms, 7_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_at_deadline() {
        let coordinator = WaitCoordinator::default();
        let spec = PollSpec::predicate(|_| false, Duration::from_secs(5))
            .poll_interval(Duration::from_secs(2));

        let outcome = coordinator
            .poll("exec-1", "never", &spec, &scope(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.satisfied);
        assert_eq!(outcome.waited_ms, 5_000);
        assert!(!outcome.escalated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_escalates_once() {
        let notifier = Arc::new(InMemoryNotifier::new());
        let coordinator = WaitCoordinator::new(notifier.clone(), RuntimeContext::default());
        let spec = PollSpec::predicate(|_| false, Duration::from_secs(10)).escalate_to("oncall");

        let outcome = coordinator
            .poll("exec-1", "health", &spec, &scope(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.satisfied);
        assert!(outcome.escalated);
        assert_eq!(outcome.waited_ms, 20_000);
        assert_eq!(notifier.count(NotificationKind::Escalated), 1);
    }
}
