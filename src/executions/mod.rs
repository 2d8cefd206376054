//! Runtime execution records: one [`PlanExecution`] per pipeline run and one
//! [`NodeExecution`] per invocation of a plan node within it.

pub mod node_execution;
pub mod plan_execution;

pub use node_execution::{ExecutableResponse, InterruptEffect, NodeExecution};
pub use plan_execution::PlanExecution;
