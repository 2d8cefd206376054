//! # Planwright: Pipeline Orchestration Engine
//!
//! Planwright executes directed plans of pipeline steps with versioned
//! persistence, out-of-band interrupts, and remote task dispatch. Plans are
//! static node graphs; each run materializes an execution tree whose records
//! move through a guarded status state machine until the whole plan
//! concludes.
//!
//! ## Core Concepts
//!
//! - **Plans**: Acyclic graphs of [`plan::PlanNode`]s, validated up front
//! - **Executions**: Per-run [`executions::NodeExecution`] records with
//!   optimistic-concurrency versioning
//! - **Statuses**: A fixed transition table over [`status::Status`]; every
//!   write is checked against it
//! - **Facilitators**: Per-node gates deciding skip vs. execution mode
//! - **Advisers**: Post-completion policies for retry, ignore, forced
//!   branching, and manual intervention
//! - **Interrupts**: Idempotent abort / pause / resume / expire signals
//!
//! ## Quick Start
//!
//! ```
//! use planwright::engine::{EngineConfig, OrchestrationEngine};
//! use planwright::plan::{PlanBuilder, PlanNode};
//! use planwright::steps::{Step, StepContext, StepError, StepRegistry, StepResponse};
//! use planwright::store::EngineStore;
//! use planwright::transport::InMemoryTransport;
//! use async_trait::async_trait;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! struct EchoStep;
//!
//! #[async_trait]
//! impl Step for EchoStep {
//!     async fn run(
//!         &self,
//!         _ambiance: &planwright::ambiance::Ambiance,
//!         _parameters: &Value,
//!         ctx: StepContext,
//!     ) -> Result<StepResponse, StepError> {
//!         ctx.emit("echo", "running")?;
//!         Ok(StepResponse::succeeded())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(EngineStore::default());
//! store.register_plan(
//!     PlanBuilder::new("demo")
//!         .add_node(PlanNode::new("build", "echo").with_next("test"))
//!         .add_node(PlanNode::new("test", "echo"))
//!         .with_start("build")
//!         .build()?,
//! )?;
//!
//! let engine = OrchestrationEngine::new(
//!     EngineConfig::default(),
//!     store,
//!     Arc::new(InMemoryTransport::default()),
//!     StepRegistry::new().register("echo", EchoStep),
//! );
//! let run = engine.start_execution("demo", Default::default(), Default::default())?;
//! let concluded = engine.run_until_settled(&run).await?;
//! assert_eq!(concluded.status, planwright::status::Status::Succeeded);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`plan`] - Static plan model and validating builder
//! - [`status`] - Status enum, transition table, severity aggregation
//! - [`executions`] - Plan/node execution records
//! - [`store`] - Versioned collections and the engine store facade
//! - [`engine`] - The command-queue orchestration engine
//! - [`steps`] - Step contract and registry
//! - [`facilitators`] - Execution-mode gates
//! - [`advisers`] - Post-completion advice policies
//! - [`interrupts`] - Out-of-band control signals
//! - [`outcomes`] - Scoped sweeping-output publication and resolution
//! - [`restraints`] - Named concurrency gates and rendezvous barriers
//! - [`timeouts`] - Absolute and active timeout tracking
//! - [`transport`] - Remote task dispatch seam and wire messages
//! - [`events`] - Engine event bus and sinks

pub mod advisers;
pub mod ambiance;
pub mod engine;
pub mod events;
pub mod executions;
pub mod facilitators;
pub mod interrupts;
pub mod outcomes;
pub mod plan;
pub mod restraints;
pub mod status;
pub mod steps;
pub mod store;
pub mod telemetry;
pub mod timeouts;
pub mod transport;
pub mod utils;
