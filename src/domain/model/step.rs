//! Step declarations and their builders.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::definition::WorkflowDefinition;
use super::policy::{RateLimit, RetryPolicy};
use crate::domain::execution::{StepOutcome, StepScope};
use crate::error::{StepError, WorkflowError};
use crate::units::{FnBlock, InlineBlock, UnitOfWork};

pub type Predicate = Arc<dyn Fn(&StepScope) -> bool + Send + Sync>;
pub type InputMapper = Arc<dyn Fn(&StepScope) -> Result<Value, StepError> + Send + Sync>;
pub type ItemsSource = Arc<dyn Fn(&StepScope) -> Result<Vec<Value>, StepError> + Send + Sync>;

/// `if`/`unless` predicates as declared. At most one may be set.
#[derive(Clone, Default)]
pub struct GuardSpec {
    when: Option<Predicate>,
    unless: Option<Predicate>,
}

impl GuardSpec {
    pub(crate) fn set_when(&mut self, predicate: Predicate) {
        self.when = Some(predicate);
    }

    pub(crate) fn set_unless(&mut self, predicate: Predicate) {
        self.unless = Some(predicate);
    }

    pub(crate) fn validate(&self, owner: &str) -> Result<(), WorkflowError> {
        if self.when.is_some() && self.unless.is_some() {
            return Err(WorkflowError::Definition(format!(
                "'{}' declares both an if and an unless guard",
                owner
            )));
        }
        Ok(())
    }

    /// Whether the guarded node should run.
    pub fn allows(&self, scope: &StepScope) -> bool {
        match (&self.when, &self.unless) {
            (Some(when), _) => when(scope),
            (None, Some(unless)) => !unless(scope),
            (None, None) => true,
        }
    }

    pub fn is_set(&self) -> bool {
        self.when.is_some() || self.unless.is_some()
    }
}

impl fmt::Debug for GuardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardSpec")
            .field("when", &self.when.is_some())
            .field("unless", &self.unless.is_some())
            .finish()
    }
}

/// What a step invokes.
#[derive(Clone)]
pub enum StepTarget {
    Unit(Arc<dyn UnitOfWork>),
    /// Nested execution of another definition.
    Workflow(Arc<WorkflowDefinition>),
    /// Nested execution of the definition that declares this step.
    Recurse,
    Block(Arc<dyn InlineBlock>),
}

impl StepTarget {
    pub fn unit<U: UnitOfWork + 'static>(unit: U) -> Self {
        StepTarget::Unit(Arc::new(unit))
    }

    pub fn workflow(definition: Arc<WorkflowDefinition>) -> Self {
        StepTarget::Workflow(definition)
    }

    pub fn block<F>(f: F) -> Self
    where
        F: Fn(&StepScope, Value) -> Result<StepOutcome, StepError> + Send + Sync + 'static,
    {
        StepTarget::Block(Arc::new(FnBlock::new(f)))
    }

    pub fn label(&self) -> String {
        match self {
            StepTarget::Unit(unit) => unit.name().to_string(),
            StepTarget::Workflow(definition) => format!("workflow:{}", definition.name()),
            StepTarget::Recurse => "workflow:self".to_string(),
            StepTarget::Block(_) => "block".to_string(),
        }
    }
}

impl From<Arc<dyn UnitOfWork>> for StepTarget {
    fn from(unit: Arc<dyn UnitOfWork>) -> Self {
        StepTarget::Unit(unit)
    }
}

impl From<Arc<WorkflowDefinition>> for StepTarget {
    fn from(definition: Arc<WorkflowDefinition>) -> Self {
        StepTarget::Workflow(definition)
    }
}

impl fmt::Debug for StepTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepTarget({})", self.label())
    }
}

/// Iteration over a collection evaluated from the current scope.
#[derive(Clone)]
pub struct IterationSpec {
    pub(crate) source: ItemsSource,
    /// 1 runs items sequentially.
    pub(crate) concurrency: usize,
    pub(crate) fail_fast: bool,
    pub(crate) continue_on_error: bool,
}

impl IterationSpec {
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }
}

/// A validated, immutable step declaration.
#[derive(Clone)]
pub struct StepDeclaration {
    pub(crate) name: String,
    pub(crate) target: StepTarget,
    pub(crate) guard: GuardSpec,
    pub(crate) input: Option<InputMapper>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry: RetryPolicy,
    pub(crate) fallbacks: Vec<StepTarget>,
    pub(crate) optional: bool,
    pub(crate) default: Option<Value>,
    pub(crate) critical: bool,
    pub(crate) throttle: Option<Duration>,
    pub(crate) rate_limit: Option<RateLimit>,
    pub(crate) each: Option<IterationSpec>,
}

impl StepDeclaration {
    pub fn builder(name: impl Into<String>, target: impl Into<StepTarget>) -> StepBuilder {
        StepBuilder::new(name, target)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &StepTarget {
        &self.target
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn fallbacks(&self) -> &[StepTarget] {
        &self.fallbacks
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn iteration(&self) -> Option<&IterationSpec> {
        self.each.as_ref()
    }

    pub fn throttle(&self) -> Option<Duration> {
        self.throttle
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.rate_limit
    }

    /// Input for one attempt. Without a mapper the iteration item is used
    /// when one is bound, otherwise the workflow input.
    pub(crate) fn resolve_input(&self, scope: &StepScope) -> Result<Value, StepError> {
        match &self.input {
            Some(mapper) => mapper(scope),
            None => Ok(scope
                .item()
                .cloned()
                .unwrap_or_else(|| scope.input().clone())),
        }
    }
}

impl fmt::Debug for StepDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDeclaration")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("guard", &self.guard)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("fallbacks", &self.fallbacks.len())
            .field("optional", &self.optional)
            .field("critical", &self.critical)
            .field("iteration", &self.each.is_some())
            .finish()
    }
}

pub struct StepBuilder {
    name: String,
    target: StepTarget,
    guard: GuardSpec,
    input: Option<InputMapper>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    fallbacks: Vec<StepTarget>,
    optional: bool,
    default: Option<Value>,
    critical: Option<bool>,
    throttle: Option<Duration>,
    rate_limit: Option<RateLimit>,
    each: Option<ItemsSource>,
    concurrency: Option<usize>,
    fail_fast: bool,
    continue_on_error: bool,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>, target: impl Into<StepTarget>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            guard: GuardSpec::default(),
            input: None,
            timeout: None,
            retry: RetryPolicy::default(),
            fallbacks: Vec::new(),
            optional: false,
            default: None,
            critical: None,
            throttle: None,
            rate_limit: None,
            each: None,
            concurrency: None,
            fail_fast: false,
            continue_on_error: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run only when the predicate holds.
    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_when(Arc::new(predicate));
        self
    }

    /// Skip when the predicate holds.
    pub fn unless<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_unless(Arc::new(predicate));
        self
    }

    pub fn input<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&StepScope) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.input = Some(Arc::new(mapper));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn fallback(mut self, target: impl Into<StepTarget>) -> Self {
        self.fallbacks.push(target.into());
        self
    }

    /// Absorb an unrecovered failure, substituting `default` as content.
    pub fn optional(mut self, default: Value) -> Self {
        self.optional = true;
        self.default = Some(default);
        self
    }

    /// Content used when the step is skipped by its guard.
    pub fn default_value(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Whether an unrecovered failure aborts the workflow. Defaults to
    /// `true` for every step that is not optional.
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = Some(critical);
        self
    }

    pub fn throttle(mut self, min_interval: Duration) -> Self {
        self.throttle = Some(min_interval);
        self
    }

    pub fn rate_limit(mut self, calls: u32, per: Duration) -> Self {
        self.rate_limit = Some(RateLimit::new(calls, per));
        self
    }

    /// Run the target once per item produced by `source`.
    pub fn each<F>(mut self, source: F) -> Self
    where
        F: Fn(&StepScope) -> Result<Vec<Value>, StepError> + Send + Sync + 'static,
    {
        self.each = Some(Arc::new(source));
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn build(self) -> Result<StepDeclaration, WorkflowError> {
        let name = self.name;
        if name.trim().is_empty() {
            return Err(WorkflowError::Definition("step name must not be empty".into()));
        }
        self.guard.validate(&name)?;

        if self.optional && self.critical == Some(true) {
            return Err(WorkflowError::Definition(format!(
                "step '{}' cannot be both optional and critical",
                name
            )));
        }
        if self.timeout.map_or(false, |t| t.is_zero()) {
            return Err(WorkflowError::Definition(format!(
                "step '{}' has a zero timeout",
                name
            )));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.calls == 0 || limit.per_ms == 0 {
                return Err(WorkflowError::Definition(format!(
                    "step '{}' has an empty rate limit",
                    name
                )));
            }
        }

        let each = match self.each {
            Some(source) => {
                if self.fail_fast && self.continue_on_error {
                    return Err(WorkflowError::Definition(format!(
                        "step '{}' cannot set both fail_fast and continue_on_error",
                        name
                    )));
                }
                let concurrency = self.concurrency.unwrap_or(1);
                if concurrency == 0 {
                    return Err(WorkflowError::Definition(format!(
                        "step '{}' has zero iteration concurrency",
                        name
                    )));
                }
                Some(IterationSpec {
                    source,
                    concurrency,
                    fail_fast: self.fail_fast,
                    continue_on_error: self.continue_on_error,
                })
            }
            None => {
                if self.concurrency.is_some() || self.fail_fast || self.continue_on_error {
                    return Err(WorkflowError::Definition(format!(
                        "step '{}' sets iteration options without `each`",
                        name
                    )));
                }
                None
            }
        };

        Ok(StepDeclaration {
            critical: self.critical.unwrap_or(!self.optional),
            name,
            target: self.target,
            guard: self.guard,
            input: self.input,
            timeout: self.timeout,
            retry: self.retry,
            fallbacks: self.fallbacks,
            optional: self.optional,
            default: self.default,
            throttle: self.throttle,
            rate_limit: self.rate_limit,
            each,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> StepTarget {
        StepTarget::block(|_, input| Ok(StepOutcome::Continue(input)))
    }

    #[test]
    fn test_if_and_unless_is_definition_error() {
        let err = StepBuilder::new("both", noop())
            .when(|_| true)
            .unless(|_| false)
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Definition(_)));
    }

    #[test]
    fn test_critical_defaults_follow_optional() {
        let critical = StepBuilder::new("a", noop()).build().unwrap();
        assert!(critical.is_critical());
        let optional = StepBuilder::new("b", noop()).optional(json!(null)).build().unwrap();
        assert!(!optional.is_critical());
        assert!(optional.is_optional());
    }

    #[test]
    fn test_optional_and_critical_conflict() {
        assert!(StepBuilder::new("a", noop())
            .optional(json!(1))
            .critical(true)
            .build()
            .is_err());
    }

    #[test]
    fn test_iteration_options_require_each() {
        assert!(StepBuilder::new("a", noop()).concurrency(4).build().is_err());
        let decl = StepBuilder::new("a", noop())
            .each(|_| Ok(vec![json!(1)]))
            .concurrency(4)
            .continue_on_error()
            .build()
            .unwrap();
        let spec = decl.iteration().unwrap();
        assert_eq!(spec.concurrency(), 4);
        assert!(spec.continue_on_error());
    }

    #[test]
    fn test_fail_fast_and_continue_on_error_conflict() {
        assert!(StepBuilder::new("a", noop())
            .each(|_| Ok(vec![]))
            .fail_fast()
            .continue_on_error()
            .build()
            .is_err());
    }
}
