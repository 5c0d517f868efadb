use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequested,
    Reminder,
    Escalated,
    TimedOut,
}

/// Message sent to approvers or escalation targets.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub request_id: String,
    pub execution_id: String,
    pub step: String,
    pub recipients: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Notification failed on channel '{channel}': {message}")]
pub struct NotifyError {
    pub channel: String,
    pub message: String,
}

/// Best-effort notification transport. Callers log failures and move on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channels: &[String], notification: &Notification)
        -> Result<(), NotifyError>;
}

pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(
        &self,
        channels: &[String],
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        tracing::info!(
            kind = ?notification.kind,
            request_id = %notification.request_id,
            step = %notification.step,
            recipients = ?notification.recipients,
            channels = ?channels,
            "{}",
            notification.message
        );
        Ok(())
    }
}

/// Records every notification; used by tests and the demo binary.
#[derive(Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent.lock().iter().filter(|n| n.kind == kind).count()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(
        &self,
        _channels: &[String],
        notification: &Notification,
    ) -> Result<(), NotifyError> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(kind: NotificationKind) -> Notification {
        Notification {
            kind,
            request_id: "req-1".into(),
            execution_id: "exec-1".into(),
            step: "approve".into(),
            recipients: vec!["manager".into()],
            message: "please review".into(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_notifier_counts_by_kind() {
        let notifier = InMemoryNotifier::new();
        let channels = vec!["email".to_string()];
        notifier
            .notify(&channels, &notification(NotificationKind::ApprovalRequested))
            .await
            .unwrap();
        notifier
            .notify(&channels, &notification(NotificationKind::Reminder))
            .await
            .unwrap();
        notifier
            .notify(&channels, &notification(NotificationKind::Reminder))
            .await
            .unwrap();
        assert_eq!(notifier.count(NotificationKind::Reminder), 2);
        assert_eq!(notifier.sent().len(), 3);
    }

    #[test]
    fn test_notify_error_display() {
        let err = NotifyError {
            channel: "slack".into(),
            message: "unreachable".into(),
        };
        assert_eq!(
            err.to_string(),
            "Notification failed on channel 'slack': unreachable"
        );
    }
}
