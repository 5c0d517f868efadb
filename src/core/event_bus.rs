use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::domain::execution::{StepStatus, WorkflowStatus};
use crate::wait::WaitStatus;

/// Engine event published while a workflow executes.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    WorkflowStarted {
        execution_id: String,
        workflow: String,
        depth: usize,
        timestamp: DateTime<Utc>,
    },

    StepStarted {
        execution_id: String,
        step: String,
        timestamp: DateTime<Utc>,
    },

    StepRetry {
        execution_id: String,
        step: String,
        attempt: u32,
        error: String,
    },

    StepFinished {
        execution_id: String,
        step: String,
        status: StepStatus,
        duration_ms: u64,
    },

    WaitTransition {
        execution_id: String,
        step: String,
        from: WaitStatus,
        to: WaitStatus,
        reason: String,
    },

    WorkflowFinished {
        execution_id: String,
        workflow: String,
        status: WorkflowStatus,
        timestamp: DateTime<Utc>,
    },
}

/// Sending half handed to the engine's [`EventEmitter`].
pub type EventSender = mpsc::UnboundedSender<WorkflowEvent>;

/// Receiving half held by whoever observes executions.
pub type EventReceiver = mpsc::UnboundedReceiver<WorkflowEvent>;

/// Unbounded, so emitting never blocks a running step.
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Optional sender; emission is skipped when nobody listens.
#[derive(Clone, Default)]
pub struct EventEmitter {
    tx: Option<EventSender>,
}

impl EventEmitter {
    pub fn new(tx: EventSender) -> Self {
        Self { tx: Some(tx) }
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_channel() {
        let (sender, mut receiver) = create_event_channel();
        let emitter = EventEmitter::new(sender);
        assert!(emitter.is_active());

        emitter.emit(WorkflowEvent::StepStarted {
            execution_id: "exec-1".to_string(),
            step: "extract".to_string(),
            timestamp: Utc::now(),
        });

        let event = receiver.recv().await.unwrap();
        match event {
            WorkflowEvent::StepStarted { step, .. } => {
                assert_eq!(step, "extract");
            }
            _ => panic!("Unexpected event type"),
        }
    }

    #[test]
    fn test_inactive_emitter_is_noop() {
        let emitter = EventEmitter::default();
        assert!(!emitter.is_active());
        emitter.emit(WorkflowEvent::StepRetry {
            execution_id: "e".into(),
            step: "s".into(),
            attempt: 2,
            error: "boom".into(),
        });
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = WorkflowEvent::StepFinished {
            execution_id: "e".into(),
            step: "s".into(),
            status: StepStatus::Skipped,
            duration_ms: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_finished");
        assert_eq!(json["status"], "skipped");
    }
}
