use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use super::StepResult;
use crate::core::result_store::ResultStore;
use crate::error::StepError;

/// Read-only view of an execution's accumulated state, handed to guards,
/// input mappers, classifiers, iteration sources and inline blocks.
#[derive(Debug, Clone)]
pub struct StepScope {
    input: Arc<Value>,
    results: Arc<ResultStore>,
    declared: Arc<HashSet<String>>,
    execution_id: Arc<str>,
    depth: usize,
    item: Option<Value>,
    index: Option<usize>,
}

impl StepScope {
    pub fn new(
        input: Arc<Value>,
        results: Arc<ResultStore>,
        declared: Arc<HashSet<String>>,
        execution_id: Arc<str>,
        depth: usize,
    ) -> Self {
        Self {
            input,
            results,
            declared,
            execution_id,
            depth,
            item: None,
            index: None,
        }
    }

    /// Scope with an iteration item bound.
    pub fn with_item(&self, item: Value, index: usize) -> Self {
        let mut scope = self.clone();
        scope.item = Some(item);
        scope.index = Some(index);
        scope
    }

    /// The validated workflow input.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Shorthand for a top-level field of the workflow input.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.input.get(key)
    }

    /// Result of a prior step. Names that the workflow never declared fail
    /// with `UnknownStep`; declared steps that have not produced a result yet
    /// fail with `InputMapping`.
    pub fn result(&self, name: &str) -> Result<&StepResult, StepError> {
        if !self.declared.contains(name) {
            return Err(StepError::UnknownStep(name.to_string()));
        }
        self.results.get(name).ok_or_else(|| {
            StepError::InputMapping(format!("step '{}' has not produced a result yet", name))
        })
    }

    /// Content of a prior step.
    pub fn output(&self, name: &str) -> Result<&Value, StepError> {
        self.result(name).map(|r| &r.content)
    }

    /// Most recently recorded step result.
    pub fn previous(&self) -> Option<&StepResult> {
        self.results.last()
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    pub fn item(&self) -> Option<&Value> {
        self.item.as_ref()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Nesting depth of the current execution (0 for a top-level run).
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> StepScope {
        let mut store = ResultStore::new();
        store.insert(StepResult::success("extract", json!({"text": "hello"})));
        let declared: HashSet<String> = ["extract", "classify"].iter().map(|s| s.to_string()).collect();
        StepScope::new(
            Arc::new(json!({"doc": "d-1"})),
            Arc::new(store),
            Arc::new(declared),
            Arc::from("exec-1"),
            0,
        )
    }

    #[test]
    fn test_lookup_prior_result() {
        let scope = scope();
        assert_eq!(scope.output("extract").unwrap()["text"], "hello");
        assert_eq!(scope.field("doc"), Some(&json!("d-1")));
        assert_eq!(scope.previous().map(|r| r.name.as_str()), Some("extract"));
    }

    #[test]
    fn test_undeclared_name_is_unknown_step() {
        match scope().result("missing") {
            Err(StepError::UnknownStep(name)) => assert_eq!(name, "missing"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_declared_but_pending_is_mapping_error() {
        assert!(matches!(
            scope().result("classify"),
            Err(StepError::InputMapping(_))
        ));
    }

    #[test]
    fn test_item_binding() {
        let scope = scope().with_item(json!("a"), 3);
        assert_eq!(scope.item(), Some(&json!("a")));
        assert_eq!(scope.index(), Some(3));
    }
}
