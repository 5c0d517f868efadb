use std::collections::HashMap;

use crate::domain::execution::StepResult;

/// Step results of one execution, keyed by step name, iterated in the order
/// the slots were first written.
///
/// The flow engine keeps the store behind an `Arc` and clones on write, so
/// concurrent branches read a consistent snapshot while the owning execution
/// accumulates their results afterwards.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    order: Vec<String>,
    results: HashMap<String, StepResult>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a slot. Rewriting an existing slot keeps its original position.
    pub fn insert(&mut self, result: StepResult) {
        if !self.results.contains_key(&result.name) {
            self.order.push(result.name.clone());
        }
        self.results.insert(result.name.clone(), result);
    }

    pub fn get(&self, name: &str) -> Option<&StepResult> {
        self.results.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.results.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepResult> {
        self.order.iter().filter_map(|name| self.results.get(name))
    }

    /// Mutable access to every slot, in no particular order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StepResult> {
        self.results.values_mut()
    }

    pub fn last(&self) -> Option<&StepResult> {
        self.order.last().and_then(|name| self.results.get(name))
    }

    pub fn into_trace(mut self) -> Vec<StepResult> {
        self.order
            .iter()
            .filter_map(|name| self.results.remove(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::StepStatus;
    use serde_json::json;

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut store = ResultStore::new();
        store.insert(StepResult::success("b", json!(2)));
        store.insert(StepResult::success("a", json!(1)));
        store.insert(StepResult::success("c", json!(3)));
        let names: Vec<&str> = store.names().collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(store.last().map(|r| r.name.as_str()), Some("c"));
    }

    #[test]
    fn test_rewrite_keeps_position() {
        let mut store = ResultStore::new();
        store.insert(StepResult::success("a", json!(1)));
        store.insert(StepResult::success("b", json!(2)));
        store.insert(StepResult::skipped("a", Some(json!("d")), "guard"));
        let trace = store.into_trace();
        assert_eq!(trace.len(), 2);
        assert_eq!(trace[0].name, "a");
        assert_eq!(trace[0].status, StepStatus::Skipped);
    }
}
