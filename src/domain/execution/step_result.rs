use serde::Serialize;
use serde_json::{Map, Value};

use super::StepStatus;
use crate::error::{ErrorInfo, StepError};
use crate::units::Usage;

/// Outcome of one iteration item. Every item carries an explicit status;
/// success is never inferred from the shape of its content.
#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub index: usize,
    pub status: StepStatus,
    pub content: Value,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ItemResult {
    pub fn new(index: usize, status: StepStatus, content: Value) -> Self {
        Self {
            index,
            status,
            content,
            attempts: 0,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Aggregated per-item results of an iteration step, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IterationResults {
    pub items: Vec<ItemResult>,
    pub successful_count: usize,
    pub failed_count: usize,
}

impl IterationResults {
    pub fn from_items(items: Vec<ItemResult>) -> Self {
        let failed_count = items.iter().filter(|i| i.is_failed()).count();
        Self {
            successful_count: items.len() - failed_count,
            failed_count,
            items,
        }
    }

    /// Per-item content list in original item order.
    pub fn contents(&self) -> Vec<Value> {
        self.items.iter().map(|i| i.content.clone()).collect()
    }

    /// Content of the items that did not fail.
    pub fn successful(&self) -> Vec<&Value> {
        self.items
            .iter()
            .filter(|i| !i.is_failed())
            .map(|i| &i.content)
            .collect()
    }

    pub fn failures(&self) -> Vec<&ItemResult> {
        self.items.iter().filter(|i| i.is_failed()).collect()
    }
}

/// Recorded result of one step (or parallel group, route, wait) in the trace.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub content: Value,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationResults>,
    /// Trace of a nested workflow invoked by this step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_trace: Option<Vec<StepResult>>,
    pub cost: f64,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl StepResult {
    fn base(name: impl Into<String>, status: StepStatus, content: Value) -> Self {
        Self {
            name: name.into(),
            status,
            content,
            duration_ms: 0,
            attempts: 0,
            error: None,
            iteration: None,
            sub_trace: None,
            cost: 0.0,
            tokens: 0,
            metadata: Map::new(),
        }
    }

    pub fn success(name: impl Into<String>, content: Value) -> Self {
        let mut result = Self::base(name, StepStatus::Success, content);
        result.attempts = 1;
        result
    }

    pub fn skipped(name: impl Into<String>, default: Option<Value>, reason: &str) -> Self {
        let mut result = Self::base(name, StepStatus::Skipped, default.unwrap_or(Value::Null));
        result
            .metadata
            .insert("skip_reason".to_string(), Value::String(reason.to_string()));
        result
    }

    pub fn failed(name: impl Into<String>, error: &StepError, content: Value) -> Self {
        let mut result = Self::base(name, StepStatus::Failed, content);
        result.error = Some(error.to_info());
        result
    }

    pub fn halted(name: impl Into<String>, output: Value) -> Self {
        Self::base(name, StepStatus::Halted, output)
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_usage(mut self, usage: &Usage) -> Self {
        self.cost = usage.cost;
        self.tokens = usage.total_tokens();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn is_skipped(&self) -> bool {
        self.status == StepStatus::Skipped
    }

    pub fn successful_count(&self) -> Option<usize> {
        self.iteration.as_ref().map(|i| i.successful_count)
    }

    pub fn failed_count(&self) -> Option<usize> {
        self.iteration.as_ref().map(|i| i.failed_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(index: usize, status: StepStatus) -> ItemResult {
        ItemResult {
            index,
            status,
            content: json!(index),
            attempts: 1,
            error: None,
        }
    }

    #[test]
    fn test_iteration_counts_use_explicit_status() {
        let results = IterationResults::from_items(vec![
            item(0, StepStatus::Success),
            item(1, StepStatus::Failed),
            item(2, StepStatus::Skipped),
        ]);
        assert_eq!(results.successful_count, 2);
        assert_eq!(results.failed_count, 1);
        assert_eq!(results.contents(), vec![json!(0), json!(1), json!(2)]);
        assert_eq!(results.successful(), vec![&json!(0), &json!(2)]);
        assert_eq!(results.failures()[0].index, 1);
    }

    #[test]
    fn test_skipped_records_reason_and_default() {
        let result = StepResult::skipped("grammar", Some(json!("n/a")), "guard");
        assert!(result.is_skipped());
        assert_eq!(result.content, json!("n/a"));
        assert_eq!(result.metadata.get("skip_reason"), Some(&json!("guard")));
        assert_eq!(result.attempts, 0);
    }

    #[test]
    fn test_failed_carries_error_info() {
        let result = StepResult::failed("classify", &StepError::message("boom"), Value::Null)
            .with_attempts(3);
        assert!(result.is_failed());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.error.as_ref().map(|e| e.kind.as_str()), Some("error"));
    }
}
