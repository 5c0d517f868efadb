//! Immutable workflow definitions and their builder.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::flow::{
    ParallelBuilder, ParallelGroup, RouteBuilder, RouteDeclaration, WaitBuilder, WaitDeclaration,
};
use super::schema::Schema;
use super::step::{GuardSpec, StepBuilder, StepDeclaration};
use crate::error::WorkflowError;

pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 10;

/// One entry of a workflow's declared sequence.
#[derive(Clone, Debug)]
pub enum FlowNode {
    Step(StepDeclaration),
    Parallel(ParallelGroup),
    Route(RouteDeclaration),
    Wait(WaitDeclaration),
}

impl FlowNode {
    pub fn name(&self) -> &str {
        match self {
            FlowNode::Step(step) => step.name(),
            FlowNode::Parallel(group) => group.name(),
            FlowNode::Route(route) => route.name(),
            FlowNode::Wait(wait) => wait.name(),
        }
    }

    pub(crate) fn guard(&self) -> &GuardSpec {
        match self {
            FlowNode::Step(step) => &step.guard,
            FlowNode::Parallel(group) => &group.guard,
            FlowNode::Route(route) => &route.guard,
            FlowNode::Wait(wait) => &wait.guard,
        }
    }
}

/// A frozen workflow definition. Built once through [`WorkflowBuilder`] and
/// never mutated by execution.
pub struct WorkflowDefinition {
    name: String,
    version: String,
    nodes: Vec<FlowNode>,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
    timeout: Option<Duration>,
    max_cost: Option<f64>,
    max_recursion_depth: usize,
    declared: Arc<HashSet<String>>,
}

impl WorkflowDefinition {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    pub fn input_schema(&self) -> Option<&Schema> {
        self.input_schema.as_ref()
    }

    pub fn output_schema(&self) -> Option<&Schema> {
        self.output_schema.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn max_cost(&self) -> Option<f64> {
        self.max_cost
    }

    pub fn max_recursion_depth(&self) -> usize {
        self.max_recursion_depth
    }

    /// Every name a step scope may look up: top-level nodes and parallel
    /// group members.
    pub fn declared_names(&self) -> &Arc<HashSet<String>> {
        &self.declared
    }
}

impl fmt::Debug for WorkflowDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowDefinition")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("nodes", &self.nodes.iter().map(FlowNode::name).collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("max_cost", &self.max_cost)
            .field("max_recursion_depth", &self.max_recursion_depth)
            .finish()
    }
}

enum PendingNode {
    Step(StepBuilder),
    Parallel(ParallelBuilder),
    Route(RouteBuilder),
    Wait(WaitBuilder),
}

pub struct WorkflowBuilder {
    name: String,
    version: String,
    nodes: Vec<PendingNode>,
    input_schema: Option<Schema>,
    output_schema: Option<Schema>,
    timeout: Option<Duration>,
    max_cost: Option<f64>,
    max_recursion_depth: usize,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "1.0".to_string(),
            nodes: Vec::new(),
            input_schema: None,
            output_schema: None,
            timeout: None,
            max_cost: None,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.nodes.push(PendingNode::Step(step));
        self
    }

    pub fn parallel(mut self, group: ParallelBuilder) -> Self {
        self.nodes.push(PendingNode::Parallel(group));
        self
    }

    pub fn route(mut self, route: RouteBuilder) -> Self {
        self.nodes.push(PendingNode::Route(route));
        self
    }

    pub fn wait(mut self, wait: WaitBuilder) -> Self {
        self.nodes.push(PendingNode::Wait(wait));
        self
    }

    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_cost(mut self, max_cost: f64) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn build(self) -> Result<Arc<WorkflowDefinition>, WorkflowError> {
        if self.nodes.is_empty() {
            return Err(WorkflowError::Definition(format!(
                "workflow '{}' declares no steps",
                self.name
            )));
        }
        if let Some(max_cost) = self.max_cost {
            if max_cost.is_nan() || max_cost < 0.0 {
                return Err(WorkflowError::Definition(format!(
                    "workflow '{}' has an invalid max cost",
                    self.name
                )));
            }
        }

        let nodes = self
            .nodes
            .into_iter()
            .map(|pending| match pending {
                PendingNode::Step(step) => step.build().map(FlowNode::Step),
                PendingNode::Parallel(group) => group.build().map(FlowNode::Parallel),
                PendingNode::Route(route) => route.build().map(FlowNode::Route),
                PendingNode::Wait(wait) => wait.build().map(FlowNode::Wait),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut declared = HashSet::new();
        for node in &nodes {
            let mut names = vec![node.name()];
            if let FlowNode::Parallel(group) = node {
                names.extend(group.members().iter().map(StepDeclaration::name));
            }
            for name in names {
                if !declared.insert(name.to_string()) {
                    return Err(WorkflowError::Definition(format!(
                        "workflow '{}' declares '{}' more than once",
                        self.name, name
                    )));
                }
            }
        }

        tracing::debug!(
            workflow = %self.name,
            nodes = nodes.len(),
            "workflow definition built"
        );

        Ok(Arc::new(WorkflowDefinition {
            name: self.name,
            version: self.version,
            nodes,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            timeout: self.timeout,
            max_cost: self.max_cost,
            max_recursion_depth: self.max_recursion_depth,
            declared: Arc::new(declared),
        }))
    }
}
