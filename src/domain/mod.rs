//! Domain layer: the workflow definition model and execution-time types.
//!
//! - [`model`]: Definitions, step declarations, schemas and policies.
//! - [`execution`]: Statuses, step results, flow-control outcomes.

pub mod execution;
pub mod model;
