use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ApprovalSlot, Decision, WaitCoordinator, WaitState, WaitStatus, WaitTransition};
use crate::core::event_bus::WorkflowEvent;
use crate::domain::model::{ApprovalSpec, TimeoutPolicy};
use crate::error::StepError;
use crate::infrastructure::{Notification, NotificationKind};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("Approval request not found: {0}")]
    NotFound(String),

    #[error("Approval request '{0}' is already resolved")]
    AlreadyResolved(String),

    #[error("'{by}' may not resolve approval request '{request_id}'")]
    NotAuthorized { request_id: String, by: String },
}

/// Identity of the wait step asking for approval.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub execution_id: String,
    pub step: String,
}

impl ApprovalRequest {
    pub fn new(execution_id: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            step: step.into(),
        }
    }
}

/// Unregisters a pending request when the waiting future finishes or is
/// dropped by an enclosing timeout.
struct SlotGuard<'a> {
    slots: &'a DashMap<String, Arc<ApprovalSlot>>,
    request_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.remove(self.request_id);
    }
}

impl WaitCoordinator {
    pub fn approve(
        &self,
        request_id: &str,
        by: &str,
        comment: Option<String>,
    ) -> Result<(), ApprovalError> {
        self.decide(
            request_id,
            by,
            Decision::Approve {
                by: by.to_string(),
                comment,
            },
        )
    }

    pub fn reject(
        &self,
        request_id: &str,
        by: &str,
        reason: Option<String>,
    ) -> Result<(), ApprovalError> {
        self.decide(
            request_id,
            by,
            Decision::Reject {
                by: by.to_string(),
                reason,
            },
        )
    }

    fn decide(&self, request_id: &str, by: &str, decision: Decision) -> Result<(), ApprovalError> {
        let slot = self
            .slots
            .get(request_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        {
            let state = slot.state.lock();
            if state.status.is_terminal() {
                return Err(ApprovalError::AlreadyResolved(request_id.to_string()));
            }
            if !state.assignees.is_empty() && !state.assignees.iter().any(|a| a == by) {
                return Err(ApprovalError::NotAuthorized {
                    request_id: request_id.to_string(),
                    by: by.to_string(),
                });
            }
        }

        let sender = slot
            .decision
            .lock()
            .take()
            .ok_or_else(|| ApprovalError::AlreadyResolved(request_id.to_string()))?;
        sender
            .send(decision)
            .map_err(|_| ApprovalError::AlreadyResolved(request_id.to_string()))
    }

    /// Opens an approval request and suspends until it is decided, times out
    /// or is cancelled.
    ///
    /// A timeout under [`TimeoutPolicy::Escalate`] reassigns the request to
    /// the escalation target and restarts the window once; the second
    /// timeout is final. The returned state carries every transition.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
        spec: &ApprovalSpec,
        cancel: &CancellationToken,
    ) -> Result<WaitState, StepError> {
        let request_id = self.runtime.id_generator.next_id();
        let created_at = self.runtime.now();
        let state = WaitState {
            request_id: request_id.clone(),
            execution_id: request.execution_id.clone(),
            step: request.step.clone(),
            approvers: spec.approvers.clone(),
            assignees: spec.approvers.clone(),
            escalate_to: spec.escalate_to.clone(),
            status: WaitStatus::Pending,
            created_at,
            timeout_at: created_at + chrono_window(spec.timeout),
            reminders_sent: 0,
            message: spec.message.clone(),
            decided_by: None,
            comment: None,
            transitions: Vec::new(),
        };

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(ApprovalSlot {
            state: Arc::new(Mutex::new(state)),
            decision: Mutex::new(Some(tx)),
        });
        self.slots.insert(request_id.clone(), Arc::clone(&slot));
        let _registered = SlotGuard {
            slots: &self.slots,
            request_id: &request_id,
        };

        tracing::info!(
            request_id = %request_id,
            execution_id = %request.execution_id,
            step = %request.step,
            approvers = ?spec.approvers,
            "approval requested"
        );
        self.send(
            &spec.channels,
            self.notification(&slot, NotificationKind::ApprovalRequested, spec.approvers.clone()),
        )
        .await;

        self.await_decision(&slot, rx, spec, cancel).await?;
        let decided = slot.state.lock().clone();
        Ok(decided)
    }

    async fn await_decision(
        &self,
        slot: &Arc<ApprovalSlot>,
        mut rx: oneshot::Receiver<Decision>,
        spec: &ApprovalSpec,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        let mut deadline = Instant::now() + spec.timeout;
        let mut next_reminder = spec.reminder_after.map(|after| Instant::now() + after);
        let mut escalated = false;

        loop {
            let reminder_at = next_reminder.unwrap_or(deadline);
            tokio::select! {
                decision = &mut rx => {
                    let Ok(decision) = decision else {
                        return Err(StepError::Cancelled("approval channel closed".into()));
                    };
                    self.apply_decision(slot, decision);
                    return Ok(());
                }
                _ = tokio::time::sleep_until(reminder_at), if next_reminder.is_some_and(|at| at < deadline) => {
                    let recipients = slot.state.lock().assignees.clone();
                    slot.state.lock().reminders_sent += 1;
                    self.send(
                        &spec.channels,
                        self.notification(slot, NotificationKind::Reminder, recipients),
                    )
                    .await;
                    next_reminder = spec.reminder_interval.map(|every| Instant::now() + every);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    match (&spec.on_timeout, &spec.escalate_to) {
                        (TimeoutPolicy::Escalate, Some(target)) if !escalated => {
                            escalated = true;
                            {
                                let mut state = slot.state.lock();
                                state.assignees = vec![target.clone()];
                                state.timeout_at = self.runtime.now() + chrono_window(spec.timeout);
                            }
                            self.transition(
                                slot,
                                WaitStatus::Escalated,
                                format!("no decision within {:?}; escalated to {}", spec.timeout, target),
                            );
                            self.send(
                                &spec.channels,
                                self.notification(slot, NotificationKind::Escalated, vec![target.clone()]),
                            )
                            .await;
                            deadline = Instant::now() + spec.timeout;
                            next_reminder = spec.reminder_after.map(|after| Instant::now() + after);
                        }
                        _ => {
                            self.transition(
                                slot,
                                WaitStatus::TimedOut,
                                format!("no decision within {:?}", spec.timeout),
                            );
                            let recipients = slot.state.lock().assignees.clone();
                            self.send(
                                &spec.channels,
                                self.notification(slot, NotificationKind::TimedOut, recipients),
                            )
                            .await;
                            return Ok(());
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(StepError::Cancelled("approval wait interrupted".into()));
                }
            }
        }
    }

    fn apply_decision(&self, slot: &ApprovalSlot, decision: Decision) {
        let (to, by, note) = match decision {
            Decision::Approve { by, comment } => (WaitStatus::Approved, by, comment),
            Decision::Reject { by, reason } => (WaitStatus::Rejected, by, reason),
        };
        {
            let mut state = slot.state.lock();
            state.decided_by = Some(by.clone());
            state.comment = note;
        }
        self.transition(slot, to, format!("{} by {}", to, by));
    }

    fn transition(&self, slot: &ApprovalSlot, to: WaitStatus, reason: String) {
        let at = self.runtime.now();
        let (execution_id, step, request_id, from) = {
            let mut state = slot.state.lock();
            let from = state.status;
            state.status = to;
            state.transitions.push(WaitTransition {
                from,
                to,
                reason: reason.clone(),
                at,
            });
            (
                state.execution_id.clone(),
                state.step.clone(),
                state.request_id.clone(),
                from,
            )
        };

        tracing::info!(
            request_id = %request_id,
            step = %step,
            from = %from,
            to = %to,
            reason = %reason,
            "approval transition"
        );
        self.runtime.events.emit(WorkflowEvent::WaitTransition {
            execution_id,
            step,
            from,
            to,
            reason,
        });
    }

    fn notification(
        &self,
        slot: &ApprovalSlot,
        kind: NotificationKind,
        recipients: Vec<String>,
    ) -> Notification {
        let state = slot.state.lock();
        let message = if state.message.is_empty() {
            format!("Approval needed for step '{}'", state.step)
        } else {
            state.message.clone()
        };
        Notification {
            kind,
            request_id: state.request_id.clone(),
            execution_id: state.execution_id.clone(),
            step: state.step.clone(),
            recipients,
            message,
        }
    }
}

fn chrono_window(window: Duration) -> ChronoDuration {
    ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime_context::{FakeIdGenerator, RuntimeContext};
    use crate::infrastructure::InMemoryNotifier;

    fn coordinator() -> (Arc<WaitCoordinator>, Arc<InMemoryNotifier>) {
        let notifier = Arc::new(InMemoryNotifier::new());
        let runtime =
            RuntimeContext::default().with_id_generator(Arc::new(FakeIdGenerator::new("req")));
        (
            Arc::new(WaitCoordinator::new(notifier.clone(), runtime)),
            notifier,
        )
    }

    async fn wait_for_pending(coordinator: &WaitCoordinator) -> WaitState {
        loop {
            if let Some(state) = coordinator.pending().into_iter().next() {
                return state;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_approve_resolves_request() {
        let (coordinator, notifier) = coordinator();
        let spec = ApprovalSpec::new(vec!["alice".into()], Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request_approval(ApprovalRequest::new("exec-1", "sign_off"), &spec, &cancel)
                    .await
            })
        };

        let pending = wait_for_pending(&coordinator).await;
        assert_eq!(pending.request_id, "req-0");
        assert_eq!(pending.status, WaitStatus::Pending);
        coordinator
            .approve("req-0", "alice", Some("looks good".into()))
            .unwrap();

        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state.status, WaitStatus::Approved);
        assert_eq!(state.decided_by.as_deref(), Some("alice"));
        assert_eq!(state.comment.as_deref(), Some("looks good"));
        assert!(coordinator.pending().is_empty());
        assert_eq!(notifier.count(NotificationKind::ApprovalRequested), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_unauthorized_decisions() {
        let (coordinator, _) = coordinator();
        assert_eq!(
            coordinator.approve("missing", "alice", None),
            Err(ApprovalError::NotFound("missing".into()))
        );

        let spec = ApprovalSpec::new(vec!["alice".into()], Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .request_approval(ApprovalRequest::new("exec-1", "gate"), &spec, &cancel)
                    .await
            })
        };
        let pending = wait_for_pending(&coordinator).await;
        assert!(matches!(
            coordinator.approve(&pending.request_id, "mallory", None),
            Err(ApprovalError::NotAuthorized { .. })
        ));
        coordinator
            .reject(&pending.request_id, "alice", Some("not now".into()))
            .unwrap();
        let state = waiter.await.unwrap().unwrap();
        assert_eq!(state.status, WaitStatus::Rejected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_then_timeout() {
        let (coordinator, notifier) = coordinator();
        let spec = ApprovalSpec::new(vec!["manager".into()], Duration::from_secs(3600))
            .escalate_to("director");
        let cancel = CancellationToken::new();

        let state = coordinator
            .request_approval(ApprovalRequest::new("exec-1", "approve"), &spec, &cancel)
            .await
            .unwrap();

        assert_eq!(state.status, WaitStatus::TimedOut);
        let path: Vec<(WaitStatus, WaitStatus)> =
            state.transitions.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            path,
            vec![
                (WaitStatus::Pending, WaitStatus::Escalated),
                (WaitStatus::Escalated, WaitStatus::TimedOut),
            ]
        );
        assert_eq!(state.assignees, vec!["director".to_string()]);
        assert_eq!(notifier.count(NotificationKind::Escalated), 1);
        assert_eq!(notifier.count(NotificationKind::TimedOut), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminders_before_deadline() {
        let (coordinator, notifier) = coordinator();
        let spec = ApprovalSpec::new(vec!["alice".into()], Duration::from_secs(100))
            .reminders(Duration::from_secs(30), Some(Duration::from_secs(30)));
        let cancel = CancellationToken::new();

        let state = coordinator
            .request_approval(ApprovalRequest::new("exec-1", "gate"), &spec, &cancel)
            .await
            .unwrap();

        // Reminders at 30s, 60s and 90s; the next one would land past the deadline.
        assert_eq!(state.reminders_sent, 3);
        assert_eq!(notifier.count(NotificationKind::Reminder), 3);
        assert_eq!(state.status, WaitStatus::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let (coordinator, _) = coordinator();
        let spec = ApprovalSpec::new(vec!["alice".into()], Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator
            .request_approval(ApprovalRequest::new("exec-1", "gate"), &spec, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled(_)));
        assert!(coordinator.pending().is_empty());
    }
}
