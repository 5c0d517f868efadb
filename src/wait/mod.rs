//! Wait coordinator: fixed delays, conditional polling and human approval.
//!
//! Every wait parks a task on a `tokio` timer; no worker thread is held for
//! the duration of the wait. Approvals are resolved from outside through
//! [`WaitCoordinator::approve`] / [`WaitCoordinator::reject`].

mod approval;
mod poll;

pub use approval::{ApprovalError, ApprovalRequest};
pub use poll::PollOutcome;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::core::runtime_context::RuntimeContext;
use crate::error::StepError;
use crate::infrastructure::{Notification, Notifier, TracingNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    Pending,
    Approved,
    Rejected,
    Escalated,
    TimedOut,
}

impl WaitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WaitStatus::Approved | WaitStatus::Rejected | WaitStatus::TimedOut
        )
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaitStatus::Pending => "pending",
            WaitStatus::Approved => "approved",
            WaitStatus::Rejected => "rejected",
            WaitStatus::Escalated => "escalated",
            WaitStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitTransition {
    pub from: WaitStatus,
    pub to: WaitStatus,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Live state of one approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitState {
    pub request_id: String,
    pub execution_id: String,
    pub step: String,
    pub approvers: Vec<String>,
    /// Who may currently resolve the request.
    pub assignees: Vec<String>,
    pub escalate_to: Option<String>,
    pub status: WaitStatus,
    pub created_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub reminders_sent: u32,
    pub message: String,
    pub decided_by: Option<String>,
    pub comment: Option<String>,
    pub transitions: Vec<WaitTransition>,
}

#[derive(Debug, Clone)]
pub(crate) enum Decision {
    Approve { by: String, comment: Option<String> },
    Reject { by: String, reason: Option<String> },
}

pub(crate) struct ApprovalSlot {
    pub(crate) state: Arc<Mutex<WaitState>>,
    pub(crate) decision: Mutex<Option<oneshot::Sender<Decision>>>,
}

/// Owner of every in-flight wait of an engine.
pub struct WaitCoordinator {
    notifier: Arc<dyn Notifier>,
    runtime: RuntimeContext,
    slots: DashMap<String, Arc<ApprovalSlot>>,
}

impl Default for WaitCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(TracingNotifier), RuntimeContext::default())
    }
}

impl WaitCoordinator {
    pub fn new(notifier: Arc<dyn Notifier>, runtime: RuntimeContext) -> Self {
        Self {
            notifier,
            runtime,
            slots: DashMap::new(),
        }
    }

    /// Suspends for `duration` unless cancelled first.
    pub async fn delay(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StepError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(StepError::Cancelled("delay interrupted".into())),
        }
    }

    /// Snapshots of every unresolved approval request.
    pub fn pending(&self) -> Vec<WaitState> {
        let mut states: Vec<WaitState> = self
            .slots
            .iter()
            .map(|entry| entry.value().state.lock().clone())
            .collect();
        states.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        states
    }

    pub fn get(&self, request_id: &str) -> Option<WaitState> {
        self.slots
            .get(request_id)
            .map(|entry| entry.value().state.lock().clone())
    }

    async fn send(&self, channels: &[String], notification: Notification) {
        if let Err(e) = self.notifier.notify(channels, &notification).await {
            tracing::warn!(
                request_id = %notification.request_id,
                kind = ?notification.kind,
                error = %e,
                "notification failed"
            );
        }
    }
}
