use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::execution_context::ExecutionType;

/// How a tenant's budget reacts once it is spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Refuse further invocations.
    #[default]
    Hard,
    /// Log and allow.
    Soft,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BudgetError {
    #[error("Budget exceeded for tenant '{tenant}': spent {spent:.4} of {limit:.4}")]
    Exceeded {
        tenant: String,
        limit: f64,
        spent: f64,
        enforcement: Enforcement,
    },
    #[error("Token budget exceeded for tenant '{tenant}': used {used} of {limit}")]
    TokensExceeded {
        tenant: String,
        limit: u64,
        used: u64,
        enforcement: Enforcement,
    },
    /// The authority itself failed; callers fail open.
    #[error("Budget authority unavailable: {0}")]
    Unavailable(String),
}

impl BudgetError {
    pub fn enforcement(&self) -> Option<Enforcement> {
        match self {
            BudgetError::Exceeded { enforcement, .. }
            | BudgetError::TokensExceeded { enforcement, .. } => Some(*enforcement),
            BudgetError::Unavailable(_) => None,
        }
    }
}

/// External budget bookkeeping consulted around every invocation.
#[async_trait]
pub trait BudgetAuthority: Send + Sync {
    async fn check(
        &self,
        agent: &str,
        tenant_id: Option<&str>,
        execution_type: ExecutionType,
    ) -> Result<(), BudgetError>;

    async fn record_spend(&self, tenant_id: &str, cost: f64, tokens: u64)
        -> Result<(), BudgetError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantBudget {
    #[serde(default)]
    pub max_cost: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub enforcement: Enforcement,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TenantSpend {
    pub cost: f64,
    pub tokens: u64,
    pub invocations: u64,
}

/// Process-local budget authority keyed by tenant id. Tenants without a
/// configured budget are unlimited.
#[derive(Clone, Default)]
pub struct InMemoryBudgetAuthority {
    budgets: Arc<HashMap<String, TenantBudget>>,
    usage: Arc<DashMap<String, Arc<Mutex<TenantSpend>>>>,
}

impl InMemoryBudgetAuthority {
    pub fn new(budgets: HashMap<String, TenantBudget>) -> Self {
        Self {
            budgets: Arc::new(budgets),
            usage: Arc::new(DashMap::new()),
        }
    }

    fn state_for(&self, tenant_id: &str) -> Arc<Mutex<TenantSpend>> {
        self.usage
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TenantSpend::default())))
            .value()
            .clone()
    }

    pub async fn spend(&self, tenant_id: &str) -> TenantSpend {
        let state = self.state_for(tenant_id);
        let guard = state.lock().await;
        *guard
    }
}

#[async_trait]
impl BudgetAuthority for InMemoryBudgetAuthority {
    async fn check(
        &self,
        _agent: &str,
        tenant_id: Option<&str>,
        _execution_type: ExecutionType,
    ) -> Result<(), BudgetError> {
        let Some(tenant) = tenant_id else {
            return Ok(());
        };
        let Some(budget) = self.budgets.get(tenant) else {
            return Ok(());
        };
        let spent = self.spend(tenant).await;
        if let Some(limit) = budget.max_cost {
            if spent.cost >= limit {
                return Err(BudgetError::Exceeded {
                    tenant: tenant.to_string(),
                    limit,
                    spent: spent.cost,
                    enforcement: budget.enforcement,
                });
            }
        }
        if let Some(limit) = budget.max_tokens {
            if spent.tokens >= limit {
                return Err(BudgetError::TokensExceeded {
                    tenant: tenant.to_string(),
                    limit,
                    used: spent.tokens,
                    enforcement: budget.enforcement,
                });
            }
        }
        Ok(())
    }

    async fn record_spend(
        &self,
        tenant_id: &str,
        cost: f64,
        tokens: u64,
    ) -> Result<(), BudgetError> {
        let state = self.state_for(tenant_id);
        let mut guard = state.lock().await;
        guard.cost += cost;
        guard.tokens = guard.tokens.saturating_add(tokens);
        guard.invocations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(enforcement: Enforcement) -> InMemoryBudgetAuthority {
        let mut budgets = HashMap::new();
        budgets.insert(
            "acme".to_string(),
            TenantBudget {
                max_cost: Some(1.0),
                max_tokens: None,
                enforcement,
            },
        );
        InMemoryBudgetAuthority::new(budgets)
    }

    #[tokio::test]
    async fn test_budget_exceeded_after_spend() {
        let authority = authority(Enforcement::Hard);
        assert!(authority
            .check("summarizer", Some("acme"), ExecutionType::Chat)
            .await
            .is_ok());
        authority.record_spend("acme", 1.5, 100).await.unwrap();
        let err = authority
            .check("summarizer", Some("acme"), ExecutionType::Chat)
            .await
            .unwrap_err();
        match err {
            BudgetError::Exceeded {
                tenant,
                limit,
                spent,
                enforcement,
            } => {
                assert_eq!(tenant, "acme");
                assert_eq!(limit, 1.0);
                assert_eq!(spent, 1.5);
                assert_eq!(enforcement, Enforcement::Hard);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_unlimited() {
        let authority = authority(Enforcement::Hard);
        authority.record_spend("other", 100.0, 1).await.unwrap();
        assert!(authority
            .check("summarizer", Some("other"), ExecutionType::Embedding)
            .await
            .is_ok());
        assert!(authority
            .check("summarizer", None, ExecutionType::Chat)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_spend_accumulates() {
        let authority = authority(Enforcement::Soft);
        authority.record_spend("acme", 0.25, 10).await.unwrap();
        authority.record_spend("acme", 0.25, 5).await.unwrap();
        let spend = authority.spend("acme").await;
        assert_eq!(spend.cost, 0.5);
        assert_eq!(spend.tokens, 15);
        assert_eq!(spend.invocations, 2);
    }
}
