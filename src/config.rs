//! Engine-wide configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::WorkflowError;

fn default_max_recursion_depth() -> usize {
    64
}

fn default_max_parallelism() -> usize {
    16
}

/// Limits applied by a [`FlowEngine`](crate::engine::FlowEngine) on top of
/// what each definition declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling for every definition's own `max_recursion_depth`.
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    /// Timeout for steps that declare none.
    #[serde(default)]
    pub default_step_timeout_ms: Option<u64>,
    /// Upper bound on concurrently running parallel members or iteration items.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_max_recursion_depth(),
            default_step_timeout_ms: None,
            max_parallelism: default_max_parallelism(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, WorkflowError> {
        let config: EngineConfig =
            serde_json::from_str(raw).map_err(|e| WorkflowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.max_parallelism == 0 {
            return Err(WorkflowError::Config(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        if self.default_step_timeout_ms == Some(0) {
            return Err(WorkflowError::Config(
                "default_step_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_fills_defaults() {
        let config = EngineConfig::from_json(r#"{"default_step_timeout_ms": 1500}"#).unwrap();
        assert_eq!(config.max_recursion_depth, 64);
        assert_eq!(config.max_parallelism, 16);
        assert_eq!(config.default_step_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_json(r#"{"max_parallelism": 0}"#),
            Err(WorkflowError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_json("not json"),
            Err(WorkflowError::Config(_))
        ));
    }
}
