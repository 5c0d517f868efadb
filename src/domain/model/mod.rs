//! Workflow definition model: declarations, schemas and policies.

mod definition;
mod flow;
mod policy;
mod schema;
mod step;

pub use definition::{FlowNode, WorkflowBuilder, WorkflowDefinition, DEFAULT_MAX_RECURSION_DEPTH};
pub use flow::{
    ApprovalSpec, Classifier, ParallelBuilder, ParallelGroup, PollCondition, PollSpec, RouteArm,
    RouteBuilder, RouteDeclaration, WaitBuilder, WaitDeclaration, WaitKind,
};
pub use policy::{Backoff, RateLimit, RetryPolicy, TimeoutPolicy};
pub use schema::{FieldSpec, FieldType, Schema};
pub use step::{
    GuardSpec, InputMapper, ItemsSource, IterationSpec, Predicate, StepBuilder, StepDeclaration,
    StepTarget,
};
