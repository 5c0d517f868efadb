use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::execution_context::ExecutionRecord;

/// Destination for per-attempt execution records.
///
/// Implementations must not block the pipeline; slow backends should hand
/// the record off (e.g. through a channel) and return.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn record(&self, record: ExecutionRecord);
}

/// Logs each record through `tracing`.
pub struct TracingExecutionSink;

#[async_trait]
impl ExecutionSink for TracingExecutionSink {
    async fn record(&self, record: ExecutionRecord) {
        if record.success {
            tracing::info!(
                agent = %record.agent,
                tenant_id = ?record.tenant_id,
                model = %record.model,
                attempt = record.attempt,
                cached = record.cached,
                cost = record.cost,
                tokens = record.total_tokens,
                duration_ms = ?record.duration_ms,
                "execution recorded"
            );
        } else {
            tracing::warn!(
                agent = %record.agent,
                tenant_id = ?record.tenant_id,
                model = %record.model,
                attempt = record.attempt,
                error = ?record.error,
                retried = record.retried,
                "failed execution recorded"
            );
        }
    }
}

/// Fire-and-forget sink forwarding records to a channel consumer.
pub struct ChannelExecutionSink {
    tx: mpsc::UnboundedSender<ExecutionRecord>,
}

impl ChannelExecutionSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ExecutionSink for ChannelExecutionSink {
    async fn record(&self, record: ExecutionRecord) {
        if self.tx.send(record).is_err() {
            tracing::debug!("execution record dropped: receiver closed");
        }
    }
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct InMemoryExecutionSink {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryExecutionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ExecutionSink for InMemoryExecutionSink {
    async fn record(&self, record: ExecutionRecord) {
        self.records.lock().push(record);
    }
}
