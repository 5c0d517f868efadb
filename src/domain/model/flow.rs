//! Composite flow nodes: parallel groups, conditional routes and waits.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::policy::TimeoutPolicy;
use super::step::{GuardSpec, InputMapper, Predicate, StepBuilder, StepDeclaration, StepTarget};
use crate::domain::execution::StepScope;
use crate::error::{StepError, WorkflowError};

pub type Classifier = Arc<dyn Fn(&StepScope) -> Result<String, StepError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct ParallelGroup {
    pub(crate) name: String,
    pub(crate) guard: GuardSpec,
    pub(crate) members: Vec<StepDeclaration>,
    pub(crate) concurrency: Option<usize>,
    pub(crate) fail_fast: bool,
    pub(crate) timeout: Option<Duration>,
}

impl ParallelGroup {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[StepDeclaration] {
        &self.members
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn is_fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

pub struct ParallelBuilder {
    name: String,
    guard: GuardSpec,
    members: Vec<StepBuilder>,
    concurrency: Option<usize>,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl ParallelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guard: GuardSpec::default(),
            members: Vec::new(),
            concurrency: None,
            fail_fast: false,
            timeout: None,
        }
    }

    pub fn step(mut self, member: StepBuilder) -> Self {
        self.members.push(member);
        self
    }

    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    /// Cancel in-flight siblings on the first critical member failure.
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }

    /// Deadline for the whole group, not each member.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_when(Arc::new(predicate));
        self
    }

    pub fn unless<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_unless(Arc::new(predicate));
        self
    }

    pub(crate) fn build(self) -> Result<ParallelGroup, WorkflowError> {
        self.guard.validate(&self.name)?;
        if self.members.is_empty() {
            return Err(WorkflowError::Definition(format!(
                "parallel group '{}' has no members",
                self.name
            )));
        }
        if self.concurrency == Some(0) {
            return Err(WorkflowError::Definition(format!(
                "parallel group '{}' has zero concurrency",
                self.name
            )));
        }
        let members = self
            .members
            .into_iter()
            .map(StepBuilder::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ParallelGroup {
            name: self.name,
            guard: self.guard,
            members,
            concurrency: self.concurrency,
            fail_fast: self.fail_fast,
            timeout: self.timeout,
        })
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// One branch of a conditional route.
#[derive(Clone)]
pub struct RouteArm {
    pub(crate) key: String,
    pub(crate) target: StepTarget,
    pub(crate) input: Option<InputMapper>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) fallbacks: Vec<StepTarget>,
}

impl RouteArm {
    pub fn new(key: impl Into<String>, target: impl Into<StepTarget>) -> Self {
        Self {
            key: key.into(),
            target: target.into(),
            input: None,
            timeout: None,
            fallbacks: Vec::new(),
        }
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

    pub fn fallback(mut self, target: impl Into<StepTarget>) -> Self {
        self.fallbacks.push(target.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Step declaration executed when this arm is selected.
    pub(crate) fn to_declaration(&self, name: &str) -> StepDeclaration {
        StepDeclaration {
            name: name.to_string(),
            target: self.target.clone(),
            guard: GuardSpec::default(),
            input: self.input.clone(),
            timeout: self.timeout,
            retry: Default::default(),
            fallbacks: self.fallbacks.clone(),
            optional: false,
            default: None,
            critical: true,
            throttle: None,
            rate_limit: None,
            each: None,
        }
    }
}

impl fmt::Debug for RouteArm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteArm")
            .field("key", &self.key)
            .field("target", &self.target)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct RouteDeclaration {
    pub(crate) name: String,
    pub(crate) guard: GuardSpec,
    pub(crate) classifier: Classifier,
    pub(crate) arms: Vec<RouteArm>,
    pub(crate) default: Option<RouteArm>,
}

impl RouteDeclaration {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arm for a classification, falling back to the default arm.
    pub fn select(&self, key: &str) -> Option<&RouteArm> {
        self.arms
            .iter()
            .find(|arm| arm.key == key)
            .or(self.default.as_ref())
    }
}

impl fmt::Debug for RouteDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDeclaration")
            .field("name", &self.name)
            .field("arms", &self.arms)
            .field("default", &self.default)
            .finish()
    }
}

pub struct RouteBuilder {
    name: String,
    guard: GuardSpec,
    classifier: Classifier,
    arms: Vec<RouteArm>,
    default: Option<RouteArm>,
}

impl RouteBuilder {
    pub fn new<F>(name: impl Into<String>, classifier: F) -> Self
    where
        F: Fn(&StepScope) -> Result<String, StepError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            guard: GuardSpec::default(),
            classifier: Arc::new(classifier),
            arms: Vec::new(),
            default: None,
        }
    }

    pub fn route(mut self, key: impl Into<String>, target: impl Into<StepTarget>) -> Self {
        self.arms.push(RouteArm::new(key, target));
        self
    }

    pub fn arm(mut self, arm: RouteArm) -> Self {
        self.arms.push(arm);
        self
    }

    pub fn default_route(mut self, arm: RouteArm) -> Self {
        self.default = Some(arm);
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_when(Arc::new(predicate));
        self
    }

    pub fn unless<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_unless(Arc::new(predicate));
        self
    }

    pub(crate) fn build(self) -> Result<RouteDeclaration, WorkflowError> {
        self.guard.validate(&self.name)?;
        if self.arms.is_empty() && self.default.is_none() {
            return Err(WorkflowError::Definition(format!(
                "route '{}' declares no routes",
                self.name
            )));
        }
        for (i, arm) in self.arms.iter().enumerate() {
            if self.arms[..i].iter().any(|other| other.key == arm.key) {
                return Err(WorkflowError::Definition(format!(
                    "route '{}' declares '{}' twice",
                    self.name, arm.key
                )));
            }
        }
        Ok(RouteDeclaration {
            name: self.name,
            guard: self.guard,
            classifier: self.classifier,
            arms: self.arms,
            default: self.default,
        })
    }
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum PollCondition {
    Predicate(Predicate),
    /// Ready once the wall clock reaches this instant.
    At(DateTime<Utc>),
}

impl fmt::Debug for PollCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollCondition::Predicate(_) => f.write_str("Predicate"),
            PollCondition::At(at) => write!(f, "At({})", at),
        }
    }
}

/// Conditional poll (`wait_until`).
#[derive(Clone, Debug)]
pub struct PollSpec {
    pub condition: PollCondition,
    pub poll_interval: Duration,
    /// Multiplier applied to the interval after each unsuccessful check.
    pub backoff: f64,
    pub max_interval: Duration,
    pub timeout: Duration,
    pub on_timeout: TimeoutPolicy,
    pub escalate_to: Option<String>,
}

impl PollSpec {
    pub fn predicate<F>(condition: F, timeout: Duration) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        Self::new(PollCondition::Predicate(Arc::new(condition)), timeout)
    }

    pub fn at(when: DateTime<Utc>, timeout: Duration) -> Self {
        Self::new(PollCondition::At(when), timeout)
    }

    fn new(condition: PollCondition, timeout: Duration) -> Self {
        Self {
            condition,
            poll_interval: Duration::from_secs(1),
            backoff: 1.0,
            max_interval: Duration::from_secs(60),
            timeout,
            on_timeout: TimeoutPolicy::Fail,
            escalate_to: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = factor;
        self.max_interval = max_interval;
        self
    }

    pub fn on_timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.on_timeout = policy;
        self
    }

    pub fn escalate_to(mut self, target: impl Into<String>) -> Self {
        self.on_timeout = TimeoutPolicy::Escalate;
        self.escalate_to = Some(target.into());
        self
    }
}

/// Human approval (`wait_for`).
#[derive(Clone, Debug)]
pub struct ApprovalSpec {
    pub approvers: Vec<String>,
    pub channels: Vec<String>,
    pub message: String,
    pub timeout: Duration,
    pub reminder_after: Option<Duration>,
    pub reminder_interval: Option<Duration>,
    pub on_timeout: TimeoutPolicy,
    pub escalate_to: Option<String>,
}

impl ApprovalSpec {
    pub fn new(approvers: Vec<String>, timeout: Duration) -> Self {
        Self {
            approvers,
            channels: Vec::new(),
            message: String::new(),
            timeout,
            reminder_after: None,
            reminder_interval: None,
            on_timeout: TimeoutPolicy::Fail,
            escalate_to: None,
        }
    }

    pub fn channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn reminders(mut self, after: Duration, interval: Option<Duration>) -> Self {
        self.reminder_after = Some(after);
        self.reminder_interval = interval;
        self
    }

    pub fn on_timeout(mut self, policy: TimeoutPolicy) -> Self {
        self.on_timeout = policy;
        self
    }

    pub fn escalate_to(mut self, target: impl Into<String>) -> Self {
        self.on_timeout = TimeoutPolicy::Escalate;
        self.escalate_to = Some(target.into());
        self
    }
}

#[derive(Clone, Debug)]
pub enum WaitKind {
    Delay(Duration),
    Until(PollSpec),
    Approval(ApprovalSpec),
}

#[derive(Clone, Debug)]
pub struct WaitDeclaration {
    pub(crate) name: String,
    pub(crate) guard: GuardSpec,
    pub(crate) kind: WaitKind,
}

impl WaitDeclaration {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &WaitKind {
        &self.kind
    }

    pub fn on_timeout(&self) -> TimeoutPolicy {
        match &self.kind {
            WaitKind::Delay(_) => TimeoutPolicy::Continue,
            WaitKind::Until(spec) => spec.on_timeout,
            WaitKind::Approval(spec) => spec.on_timeout,
        }
    }
}

pub struct WaitBuilder {
    name: String,
    guard: GuardSpec,
    kind: WaitKind,
}

impl WaitBuilder {
    pub fn delay(name: impl Into<String>, duration: Duration) -> Self {
        Self::new(name, WaitKind::Delay(duration))
    }

    pub fn until(name: impl Into<String>, spec: PollSpec) -> Self {
        Self::new(name, WaitKind::Until(spec))
    }

    pub fn approval(name: impl Into<String>, spec: ApprovalSpec) -> Self {
        Self::new(name, WaitKind::Approval(spec))
    }

    fn new(name: impl Into<String>, kind: WaitKind) -> Self {
        Self {
            name: name.into(),
            guard: GuardSpec::default(),
            kind,
        }
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_when(Arc::new(predicate));
        self
    }

    pub fn unless<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepScope) -> bool + Send + Sync + 'static,
    {
        self.guard.set_unless(Arc::new(predicate));
        self
    }

    pub(crate) fn build(self) -> Result<WaitDeclaration, WorkflowError> {
        self.guard.validate(&self.name)?;
        let (policy, escalate_to, timeout) = match &self.kind {
            WaitKind::Delay(_) => (TimeoutPolicy::Continue, None, None),
            WaitKind::Until(spec) => {
                if spec.poll_interval.is_zero() {
                    return Err(WorkflowError::Definition(format!(
                        "wait '{}' has a zero poll interval",
                        self.name
                    )));
                }
                if spec.backoff < 1.0 {
                    return Err(WorkflowError::Definition(format!(
                        "wait '{}' has a backoff factor below 1",
                        self.name
                    )));
                }
                (spec.on_timeout, spec.escalate_to.as_ref(), Some(spec.timeout))
            }
            WaitKind::Approval(spec) => {
                if spec.approvers.is_empty() {
                    return Err(WorkflowError::Definition(format!(
                        "approval '{}' has no approvers",
                        self.name
                    )));
                }
                (spec.on_timeout, spec.escalate_to.as_ref(), Some(spec.timeout))
            }
        };
        if policy == TimeoutPolicy::Escalate && escalate_to.is_none() {
            return Err(WorkflowError::Definition(format!(
                "wait '{}' escalates on timeout but names no escalation target",
                self.name
            )));
        }
        if timeout.map_or(false, |t| t.is_zero()) {
            return Err(WorkflowError::Definition(format!(
                "wait '{}' has a zero timeout",
                self.name
            )));
        }
        Ok(WaitDeclaration {
            name: self.name,
            guard: self.guard,
            kind: self.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::execution::StepOutcome;

    fn noop() -> StepTarget {
        StepTarget::block(|_, input| Ok(StepOutcome::Continue(input)))
    }

    #[test]
    fn test_parallel_requires_members() {
        assert!(ParallelBuilder::new("checks").build().is_err());
        let group = ParallelBuilder::new("checks")
            .step(StepBuilder::new("a", noop()))
            .step(StepBuilder::new("b", noop()))
            .concurrency(1)
            .build()
            .unwrap();
        assert_eq!(group.members().len(), 2);
        assert_eq!(group.concurrency(), Some(1));
    }

    #[test]
    fn test_route_selects_arm_or_default() {
        let route = RouteBuilder::new("dispatch", |_| Ok("billing".into()))
            .route("billing", noop())
            .default_route(RouteArm::new("general", noop()))
            .build()
            .unwrap();
        assert_eq!(route.select("billing").map(|a| a.key()), Some("billing"));
        assert_eq!(route.select("other").map(|a| a.key()), Some("general"));
    }

    #[test]
    fn test_route_rejects_duplicate_keys() {
        assert!(RouteBuilder::new("dispatch", |_| Ok("a".into()))
            .route("a", noop())
            .route("a", noop())
            .build()
            .is_err());
    }

    #[test]
    fn test_escalation_requires_target() {
        let spec = ApprovalSpec::new(vec!["manager".into()], Duration::from_secs(3600))
            .on_timeout(TimeoutPolicy::Escalate);
        assert!(WaitBuilder::approval("approve", spec).build().is_err());

        let spec = ApprovalSpec::new(vec!["manager".into()], Duration::from_secs(3600))
            .escalate_to("director");
        let wait = WaitBuilder::approval("approve", spec).build().unwrap();
        assert_eq!(wait.on_timeout(), TimeoutPolicy::Escalate);
    }

    #[test]
    fn test_poll_backoff_below_one_rejected() {
        let spec = PollSpec::predicate(|_| true, Duration::from_secs(10))
            .backoff(0.5, Duration::from_secs(5));
        assert!(WaitBuilder::until("ready", spec).build().is_err());
    }
}
