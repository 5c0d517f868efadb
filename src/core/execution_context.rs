//! Per-invocation state carried through the middleware pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::runtime_context::millis_between;
use crate::error::ErrorInfo;

/// What kind of unit-of-work invocation a context describes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    #[default]
    Chat,
    Embedding,
    Image,
    Audio,
    Workflow,
}

/// Mutable carrier of one unit-of-work invocation: resolved tenant, model,
/// timing, usage, cache status and an open metadata bag.
///
/// A failed attempt that was retried by the reliability layer keeps its own
/// state and links to the follow-up attempt through [`retry`](Self::retry).
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub agent: String,
    pub agent_version: String,
    pub execution_type: ExecutionType,
    pub input: Value,
    pub parameters: Value,
    pub tenant_id: Option<String>,
    pub model: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based attempt number across the whole invocation, 0 before the first
    /// attempt starts.
    pub attempt: u32,
    /// Attempts made against the current model.
    pub model_attempt: u32,
    /// 0 while on the primary model, `n` once on the n-th fallback model.
    pub fallback_index: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub cached: bool,
    pub cache_key: Option<String>,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub metadata: Map<String, Value>,
    pub retry: Option<Box<ExecutionContext>>,
}

impl ExecutionContext {
    pub fn new(agent: impl Into<String>, input: Value) -> Self {
        Self {
            agent: agent.into(),
            agent_version: "1.0".to_string(),
            execution_type: ExecutionType::default(),
            input,
            parameters: Value::Object(Map::new()),
            tenant_id: None,
            model: String::new(),
            started_at: None,
            completed_at: None,
            attempt: 0,
            model_attempt: 0,
            fallback_index: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            cached: false,
            cache_key: None,
            output: None,
            error: None,
            metadata: Map::new(),
            retry: None,
        }
    }

    /// Defined only once both timestamps are set.
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(millis_between(start, end)),
            _ => None,
        }
    }

    /// Succeeded with a non-empty output. `null`, `""`, `{}` and `[]` all
    /// count as no output, so they are never cached or recorded as success.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.output.as_ref().is_some_and(|v| !is_empty_output(v))
    }

    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// The attempt that produced the final outcome.
    pub fn final_attempt(&self) -> &ExecutionContext {
        let mut current = self;
        while let Some(next) = current.retry.as_deref() {
            current = next;
        }
        current
    }

    /// Every attempt in order, starting with this one.
    pub fn attempts(&self) -> Vec<&ExecutionContext> {
        let mut out = vec![self];
        let mut current = self;
        while let Some(next) = current.retry.as_deref() {
            out.push(next);
            current = next;
        }
        out
    }

    /// Cost summed over every attempt.
    pub fn aggregate_cost(&self) -> f64 {
        self.attempts().iter().map(|c| c.cost).sum()
    }

    /// Tokens summed over every attempt.
    pub fn aggregate_tokens(&self) -> u64 {
        self.attempts().iter().map(|c| c.total_tokens()).sum()
    }

    /// Copy for a retry attempt: keeps resolved cross-cutting state (tenant,
    /// model, cache key, metadata) and clears execution-specific state.
    pub fn dup_for_retry(&self) -> ExecutionContext {
        ExecutionContext {
            agent: self.agent.clone(),
            agent_version: self.agent_version.clone(),
            execution_type: self.execution_type,
            input: self.input.clone(),
            parameters: self.parameters.clone(),
            tenant_id: self.tenant_id.clone(),
            model: self.model.clone(),
            started_at: None,
            completed_at: None,
            attempt: 0,
            model_attempt: 0,
            fallback_index: self.fallback_index,
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            cached: false,
            cache_key: self.cache_key.clone(),
            output: None,
            error: None,
            metadata: self.metadata.clone(),
            retry: None,
        }
    }

    /// Flattened, loggable snapshot of this attempt.
    pub fn to_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            agent: self.agent.clone(),
            agent_version: self.agent_version.clone(),
            execution_type: self.execution_type,
            tenant_id: self.tenant_id.clone(),
            model: self.model.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms(),
            attempt: self.attempt,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            total_tokens: self.total_tokens(),
            cost: self.cost,
            cached: self.cached,
            success: self.is_success(),
            retried: self.retry.is_some(),
            error: self.error.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Snapshot of a single attempt handed to the execution sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub agent: String,
    pub agent_version: String,
    pub execution_type: ExecutionType,
    pub tenant_id: Option<String>,
    pub model: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub attempt: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub cached: bool,
    pub success: bool,
    pub retried: bool,
    pub error: Option<ErrorInfo>,
    pub metadata: Map<String, Value>,
}

fn is_empty_output(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
